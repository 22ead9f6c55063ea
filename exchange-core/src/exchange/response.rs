//! The response handle: status, headers, trailers and the body stream.

use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::error::{Error, Result};

/// Coarse status category, mirroring the header service's parsed views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Other,
}

impl From<StatusCode> for StatusCategory {
    fn from(status: StatusCode) -> Self {
        match status.as_u16() {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

/// The bounded, single-consumer body chunk channel.
///
/// `BodySink` is held by the connection engine; `BodyStream` is handed to
/// the caller. Only one `BodyStream` may ever be taken (enforced by
/// `ResponseHandle::take_body`) — a response body has exactly one
/// consumer.
const BODY_CHANNEL_CAPACITY: usize = 16;

pub struct BodySink {
    tx: PollSender<Bytes>,
}

impl BodySink {
    /// Push a chunk. On overflow (receiver dropped or lagging past its
    /// buffer) the chunk is dropped and the error returned so the caller can
    /// release the underlying buffer.
    pub async fn send(&mut self, chunk: Bytes) -> Result<()> {
        use futures_util::SinkExt;
        self.tx
            .send(chunk)
            .await
            .map_err(|_| Error::new_connection_closed().with("response body consumer gone"))
    }
}

pub struct BodyStream {
    rx: mpsc::Receiver<Bytes>,
}

impl BodyStream {
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

pub fn body_channel() -> (BodySink, BodyStream) {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    (
        BodySink {
            tx: PollSender::new(tx),
        },
        BodyStream { rx },
    )
}

/// The response side of an exchange.
pub struct ResponseHandle {
    pub status: StatusCode,
    pub category: StatusCategory,
    headers: HeaderMap,
    trailers: Mutex<Option<HeaderMap>>,
    trailers_set: std::sync::atomic::AtomicBool,
    body: Mutex<Option<BodyStream>>,
}

impl ResponseHandle {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            category: status.into(),
            status,
            headers,
            trailers: Mutex::new(None),
            trailers_set: std::sync::atomic::AtomicBool::new(false),
            body: Mutex::new(Some(body)),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Set once, when the last-chunk frame carries trailers. A second call
    /// is a logic error in the engine, not a caller-facing one.
    pub(crate) fn set_trailers(&self, trailers: HeaderMap) {
        if self
            .trailers_set
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        *self.trailers.lock().unwrap_or_else(|e| e.into_inner()) = Some(trailers);
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.trailers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take the body stream. Returns an error on a second call: response
    /// bodies are single-consumer.
    pub fn take_body(&self) -> Result<BodyStream> {
        self.body
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                Error::new_protocol_error().with("response body already subscribed")
            })
    }

    pub fn requests_close(&self) -> bool {
        self.headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_body_is_single_consumer() {
        let (_sink, stream) = body_channel();
        let resp = ResponseHandle::new(StatusCode::OK, HeaderMap::new(), stream);
        assert!(resp.take_body().is_ok());
        assert!(resp.take_body().is_err());
    }

    #[test]
    fn status_category_buckets_correctly() {
        assert_eq!(
            StatusCategory::from(StatusCode::NOT_FOUND),
            StatusCategory::ClientError
        );
        assert_eq!(
            StatusCategory::from(StatusCode::SWITCHING_PROTOCOLS),
            StatusCategory::Informational
        );
    }

    #[test]
    fn trailers_can_only_be_set_once() {
        let (_sink, stream) = body_channel();
        let resp = ResponseHandle::new(StatusCode::OK, HeaderMap::new(), stream);
        let mut first = HeaderMap::new();
        first.insert("x-a", http::HeaderValue::from_static("1"));
        resp.set_trailers(first);
        let mut second = HeaderMap::new();
        second.insert("x-b", http::HeaderValue::from_static("2"));
        resp.set_trailers(second);
        let got = resp.trailers().expect("trailers set");
        assert!(got.get("x-a").is_some());
        assert!(got.get("x-b").is_none());
    }
}
