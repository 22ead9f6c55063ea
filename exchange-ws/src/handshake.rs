//! The RFC 6455 §4 opening handshake: client request header construction
//! and 101-response verification.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{HeaderMap, HeaderValue, StatusCode};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A freshly generated `Sec-WebSocket-Key` plus the request headers it
/// belongs in.
pub struct ClientHandshake {
    pub key: String,
    pub headers: HeaderMap,
}

/// Build the upgrade request headers for a client-initiated handshake.
/// `subprotocols`, if non-empty, is offered via `Sec-WebSocket-Protocol`;
/// the response must select one of them or the handshake fails.
pub fn build_client_request(subprotocols: &[String]) -> ClientHandshake {
    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = BASE64.encode(key_bytes);

    let mut headers = HeaderMap::new();
    headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        http::header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(&key).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        http::header::SEC_WEBSOCKET_VERSION,
        HeaderValue::from_static("13"),
    );
    if !subprotocols.is_empty() {
        let joined = subprotocols.join(", ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(http::header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    ClientHandshake { key, headers }
}

fn derive_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Verify a `101 Switching Protocols` response against the handshake that
/// produced `key`. On success, returns the negotiated subprotocol (if
/// any). Fails the whole handshake (per the requirement that a required
/// subprotocol must be present) when `subprotocols` was non-empty but the
/// response's `Sec-WebSocket-Protocol` does not name one of them.
pub fn verify_server_response(
    status: StatusCode,
    headers: &HeaderMap,
    key: &str,
    offered_subprotocols: &[String],
) -> Result<Option<String>> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(%status, "handshake rejected: expected 101 Switching Protocols");
        return Err(Error::new_handshake_failed()
            .with(format!("expected 101 Switching Protocols, got {status}")));
    }
    let upgrade_ok = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(Error::new_handshake_failed().with("response missing Upgrade: websocket"));
    }
    let connection_ok = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"));
    if !connection_ok {
        return Err(Error::new_handshake_failed().with("response missing Connection: Upgrade"));
    }

    let expected_accept = derive_accept_key(key);
    let accept_ok = headers
        .get(http::header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected_accept);
    if !accept_ok {
        warn!("handshake rejected: Sec-WebSocket-Accept did not match");
        return Err(Error::new_handshake_failed().with("Sec-WebSocket-Accept did not match"));
    }

    let negotiated = headers
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !offered_subprotocols.is_empty() {
        match &negotiated {
            Some(value) if offered_subprotocols.iter().any(|p| p == value) => {}
            _ => {
                warn!("handshake rejected: server did not select an offered subprotocol");
                return Err(Error::new_subprotocol_negotiation_failed()
                    .with("server did not select one of the offered subprotocols"))
            }
        }
    }

    debug!(subprotocol = ?negotiated, "handshake accepted");
    Ok(negotiated)
}
