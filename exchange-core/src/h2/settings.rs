//! The SETTINGS payload carried in the H2C upgrade's `HTTP2-Settings`
//! request header (RFC 7540 §3.2: 6-byte entries, `key(16) value(32)`,
//! base64url-encoded with no padding).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;

/// The handful of SETTINGS entries this core needs to announce during an
/// H2C upgrade or a direct HTTP/2 preface. A full HTTP/2 engine would also
/// negotiate `SETTINGS_MAX_FRAME_SIZE`/`SETTINGS_MAX_HEADER_LIST_SIZE`; at
/// the interface level this crate stops at, these three are sufficient to
/// exercise the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub max_concurrent_streams: u32,
    pub initial_window_size: Option<u32>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: None,
            max_concurrent_streams: 100,
            initial_window_size: None,
        }
    }
}

impl Http2Settings {
    /// Encode as the RFC 7540 §6.5.1 SETTINGS frame payload: a sequence of
    /// 6-byte `(u16 identifier, u32 value)` entries, big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        if let Some(size) = self.header_table_size {
            push_entry(&mut out, SETTINGS_HEADER_TABLE_SIZE, size);
        }
        push_entry(
            &mut out,
            SETTINGS_MAX_CONCURRENT_STREAMS,
            self.max_concurrent_streams,
        );
        if let Some(size) = self.initial_window_size {
            push_entry(&mut out, SETTINGS_INITIAL_WINDOW_SIZE, size);
        }
        out
    }

    /// Render as the base64url (no padding) value for the `HTTP2-Settings`
    /// request header.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode())
    }
}

fn push_entry(out: &mut Vec<u8>, id: u16, value: u32) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_six_byte_entries() {
        let settings = Http2Settings {
            header_table_size: None,
            max_concurrent_streams: 100,
            initial_window_size: None,
        };
        let encoded = settings.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(&encoded[0..2], &SETTINGS_MAX_CONCURRENT_STREAMS.to_be_bytes());
        assert_eq!(&encoded[2..6], &100u32.to_be_bytes());
    }

    #[test]
    fn base64url_has_no_padding() {
        let settings = Http2Settings::default();
        let encoded = settings.to_base64url();
        assert!(!encoded.contains('='));
    }

    #[test]
    fn multiple_entries_concatenate_in_order() {
        let settings = Http2Settings {
            header_table_size: Some(4096),
            max_concurrent_streams: 100,
            initial_window_size: Some(65535),
        };
        let encoded = settings.encode();
        assert_eq!(encoded.len(), 18);
    }
}
