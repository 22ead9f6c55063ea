//! The request handle: method, authority, path, headers and optional body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::{HeaderMap, HeaderValue, Method};

use crate::error::{Error, Result};
use crate::transport::TransportInfo;

use super::body::RequestBody;

/// `host[:port]`, with the port elided when it matches the scheme default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    host: String,
    port: Option<u16>,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: Option<u16>, scheme: &str) -> Self {
        let default_port = default_port_for_scheme(scheme);
        let port = port.filter(|p| Some(*p) != default_port);
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render as the `Host` header value: `host` alone when the port was
    /// elided, `host:port` otherwise.
    pub fn as_host_header(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// A cloneable path + query builder. Cloning lets the H2C upgrade
/// coordinator and redirect handling reuse a path without re-parsing it.
#[derive(Debug, Clone, Default)]
pub struct PathBuilder {
    path: String,
    query: Vec<(String, String)>,
}

impl PathBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn push_query(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Render `path?k=v&...`, percent-encoding left to the caller (the
    /// header/body service owns encoding rules).
    pub fn build(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let mut out = self.path.clone();
        out.push('?');
        let mut first = true;
        for (k, v) in &self.query {
            if !first {
                out.push('&');
            }
            first = false;
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lazily parsed query parameters, as they currently stand.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }
}

/// The request side of an exchange, as handed to a connection engine.
///
/// Headers are mutable only until [`RequestHandle::mark_headers_written`] is
/// called; subsequent mutation attempts return
/// [`crate::error::Kind::ProtocolError`].
pub struct RequestHandle {
    pub method: Method,
    authority: Authority,
    path: PathBuilder,
    transport: TransportInfo,
    headers: HeaderMap,
    headers_written: AtomicBool,
    body: Option<RequestBody>,
}

impl RequestHandle {
    pub fn new(
        method: Method,
        authority: Authority,
        path: PathBuilder,
        transport: TransportInfo,
        body: Option<RequestBody>,
    ) -> Arc<Self> {
        let mut headers = HeaderMap::new();
        let host_value = HeaderValue::from_str(&authority.as_host_header())
            .unwrap_or_else(|_| HeaderValue::from_static(""));
        headers.insert(http::header::HOST, host_value);
        Arc::new(Self {
            method,
            authority,
            path,
            transport,
            headers,
            headers_written: AtomicBool::new(false),
            body,
        })
    }

    pub fn scheme(&self) -> &'static str {
        self.transport.http_scheme()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn path_builder(&self) -> &PathBuilder {
        &self.path
    }

    pub fn transport_info(&self) -> &TransportInfo {
        &self.transport
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Take the body out for writing. The engine calls this exactly once,
    /// while rendering the request onto the wire.
    pub(crate) fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    pub fn is_headers_written(&self) -> bool {
        self.headers_written.load(Ordering::Acquire)
    }

    /// Mutate headers; errors once `headers_written` has flipped true.
    pub fn with_headers_mut<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HeaderMap),
    {
        if self.is_headers_written() {
            return Err(Error::new_protocol_error().with("headers already written"));
        }
        f(&mut self.headers);
        Ok(())
    }

    /// Called by the engine exactly once, when the request line and header
    /// block have been handed to the transport.
    pub(crate) fn mark_headers_written(&self) {
        self.headers_written.store(true, Ordering::Release);
    }
}
