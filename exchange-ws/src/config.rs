//! Tunables for a WebSocket connection engine.

/// Tunables for the WebSocket connection engine: frame and message size
/// caps, plus the close-on-complete policy for the outbound publisher.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bound on a single frame's payload. `None` disables the check (still
    /// subject to the 125-byte control-frame cap, which is unconditional).
    pub max_frame_size: Option<usize>,
    /// Bound on an assembled message (the sum of a data frame plus its
    /// CONTINUATION frames). `None` disables the check.
    pub max_message_size: Option<usize>,
    /// Whether the socket closes when the outbound publisher completes
    /// successfully. On an outbound error the socket is always closed,
    /// regardless of this setting.
    pub close_on_complete: bool,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: None,
            max_message_size: None,
            close_on_complete: true,
        }
    }
}
