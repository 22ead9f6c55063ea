//! Wire-level framing for HTTP/1.0 and HTTP/1.1 (RFC 7230): request line,
//! header block, `Content-Length`/`Transfer-Encoding: chunked`, and trailers
//! carried on the last chunk.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};

use crate::error::{Error, Result};
use crate::exchange::request::Authority;

/// A decoded response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// How the response body is framed, decided from the response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body (e.g. 204, 304, or a HEAD response).
    Empty,
    Known(u64),
    Chunked,
    /// Read until the connection closes (HTTP/1.0 with no Content-Length).
    UntilClose,
}

/// Render the request line and header block. Does not include a trailing
/// body; callers append the framed body separately.
pub fn encode_request_head(
    method: &Method,
    path: &str,
    version: Version,
    authority: &Authority,
    headers: &HeaderMap,
    framing: Option<&str>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    let version_str = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(path.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(version_str.as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(b"host: ");
    buf.put_slice(authority.as_host_header().as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers {
        if name == http::header::HOST {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(framing) = framing {
        buf.put_slice(framing.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub fn content_length_header(len: u64) -> String {
    format!("content-length: {len}")
}

pub const CHUNKED_TRANSFER_ENCODING_HEADER: &str = "transfer-encoding: chunked";

/// Encode one chunk in chunked transfer-encoding: `<hex-len>\r\n<data>\r\n`.
/// An empty `data` slice encodes the terminating zero-length chunk (callers
/// append trailers + the final `\r\n` via [`encode_chunked_trailer`]).
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// The terminating `0\r\n` chunk, optionally carrying trailers, followed by
/// the blank line that ends the message.
pub fn encode_chunked_trailer(trailers: Option<&HeaderMap>) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Attempt to parse a complete response head out of `buf`. Returns `None`
/// when more bytes are needed. An `Err` means the head is malformed or
/// carries an unsupported version; the caller tears the connection down
/// rather than treating this as a partial response.
pub fn try_parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; 128];
    let mut parsed = httparse::Response::new(&mut header_storage);
    let status = parsed
        .parse(buf)
        .map_err(|e| Error::new_protocol_error().with(e))?;

    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let code = parsed
        .code
        .ok_or_else(|| Error::new_protocol_error().with("response missing status code"))?;
    let status_code =
        StatusCode::from_u16(code).map_err(|e| Error::new_protocol_error().with(e))?;

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => {
            return Err(Error::new_protocol_error().with("unsupported HTTP version"));
        }
    };

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        let name = http::HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::new_protocol_error().with(e))?;
        let value = http::HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::new_protocol_error().with(e))?;
        headers.append(name, value);
    }

    Ok(Some((
        ResponseHead {
            version,
            status: status_code,
            headers,
        },
        consumed,
    )))
}

/// Decide body framing for a response, per RFC 7230 §3.3.3.
pub fn response_body_length(method: &Method, head: &ResponseHead) -> BodyLength {
    if method == Method::HEAD
        || matches!(head.status.as_u16(), 204 | 304)
        || head.status.as_u16() < 200
    {
        return BodyLength::Empty;
    }

    if let Some(te) = head.headers.get(http::header::TRANSFER_ENCODING) {
        if te
            .to_str()
            .unwrap_or_default()
            .split(',')
            .any(|tok| tok.trim().eq_ignore_ascii_case("chunked"))
        {
            return BodyLength::Chunked;
        }
    }

    if let Some(cl) = head.headers.get(http::header::CONTENT_LENGTH) {
        if let Ok(len) = cl.to_str().unwrap_or_default().parse::<u64>() {
            return BodyLength::Known(len);
        }
    }

    if head.version == Version::HTTP_10 {
        BodyLength::UntilClose
    } else {
        BodyLength::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_200_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n";
        let (head, consumed) = try_parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(consumed, raw.len());
        assert_eq!(
            response_body_length(&Method::GET, &head),
            BodyLength::Known(7)
        );
    }

    #[test]
    fn partial_head_returns_none() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(try_parse_response_head(raw).unwrap().is_none());
    }

    #[test]
    fn unsupported_version_is_protocol_error() {
        // httparse won't parse a `HTTP/2.0` request line as a response head;
        // simulate the post-upgrade preface bytes which a response parser
        // must reject outright as it does not begin with `HTTP/`.
        let raw = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
        assert!(try_parse_response_head(raw).is_err());
    }

    #[test]
    fn chunked_takes_precedence_over_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 7\r\n\r\n";
        let (head, _) = try_parse_response_head(raw).unwrap().unwrap();
        assert_eq!(response_body_length(&Method::GET, &head), BodyLength::Chunked);
    }

    #[test]
    fn head_request_has_no_body_regardless_of_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n";
        let (head, _) = try_parse_response_head(raw).unwrap().unwrap();
        assert_eq!(response_body_length(&Method::HEAD, &head), BodyLength::Empty);
    }
}
