//! Server side of the opening handshake.
//!
//! The surrounding HTTP server parses the upgrade request, hijacks the
//! connection and hands the raw stream here; [`Upgrader::upgrade`] validates
//! the request, writes the `101 Switching Protocols` response directly onto
//! the stream and returns a [`Conn`] in the server role.

use std::sync::Arc;
use std::time::Duration;

use http::{header, HeaderMap, Method, Request, StatusCode};

use crate::compression::DeflateExt;
use crate::conn::{BufferPool, Conn, ConnConfig, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use crate::key::compute_accept_key;
use crate::stream::Stream;
use crate::token::{equal_ascii_fold, header_list_contains_value, parse_extensions};
use crate::{Error, Result, Role};

/// Builds a complete raw HTTP error response for a rejected handshake.
pub type ErrorResponder = Box<dyn Fn(StatusCode, &Error) -> Vec<u8> + Send + Sync>;

/// Predicate deciding whether a request's origin is acceptable.
pub type OriginCheck = Box<dyn Fn(&Request<()>) -> bool + Send + Sync>;

/// Returns true if the request looks like a WebSocket upgrade: `Connection`
/// contains the `upgrade` token and `Upgrade` contains `websocket`.
pub fn is_websocket_upgrade(request: &Request<()>) -> bool {
    header_list_contains_value(request.headers(), "connection", "upgrade")
        && header_list_contains_value(request.headers(), "upgrade", "websocket")
}

/// The subprotocols requested by the client in `Sec-WebSocket-Protocol`,
/// comma-separated and trimmed.
pub fn subprotocols(request: &Request<()>) -> Vec<String> {
    let Some(raw) = request
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
    else {
        return Vec::new();
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|token| token.trim().to_owned()).collect()
}

// The default origin policy: accept when Origin is absent or its host equals
// the Host header under ASCII case folding.
fn check_same_origin(request: &Request<()>) -> bool {
    let Some(origin) = request.headers().get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = origin_url.host_str() else {
        return false;
    };
    let origin_host = match origin_url.port() {
        Some(port) => format!("{origin_host}:{port}"),
        None => origin_host.to_owned(),
    };
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    equal_ascii_fold(&origin_host, host)
}

/// Upgrades hijacked HTTP/1.1 connections to WebSocket connections.
///
/// All fields have usable defaults; an `Upgrader` is typically long-lived and
/// shared across requests.
pub struct Upgrader {
    /// Maximum duration for writing the handshake response.
    pub handshake_timeout: Option<Duration>,

    /// I/O buffer sizes; zero selects the 4096-byte default.
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    /// Optional source of write buffers shared between connections.
    pub write_buffer_pool: Option<Arc<dyn BufferPool>>,

    /// Supported subprotocols. The first client-offered token found in this
    /// list is selected. When empty, a `Sec-WebSocket-Protocol` value in the
    /// caller's response headers is used verbatim instead.
    pub subprotocols: Vec<String>,

    /// Custom error response generator; the default writes a plain-text
    /// error page.
    pub error: Option<ErrorResponder>,

    /// Origin predicate; the default accepts requests whose `Origin` is
    /// absent or matches the `Host` header.
    pub check_origin: Option<OriginCheck>,

    /// Offer `permessage-deflate` to clients that request it.
    pub enable_compression: bool,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            read_buffer_size: 0,
            write_buffer_size: 0,
            write_buffer_pool: None,
            subprotocols: Vec::new(),
            error: None,
            check_origin: None,
            enable_compression: false,
        }
    }
}

impl Upgrader {
    /// Upgrades a hijacked connection.
    ///
    /// `request` carries the method and headers of the already-parsed HTTP
    /// request; `buffered` is whatever the server's reader had consumed
    /// beyond the request head. It must be empty; a client may not speak
    /// before the handshake completes. `response_headers` are emitted with
    /// the `101` response, e.g. for cookies.
    ///
    /// On validation failure an HTTP error response is written to the stream
    /// and the corresponding error returned.
    pub fn upgrade<S: Stream>(
        &self,
        stream: S,
        request: &Request<()>,
        response_headers: Option<&HeaderMap>,
        buffered: &[u8],
    ) -> Result<Conn<S>> {
        if let Err(err) = self.validate(request, response_headers) {
            let status = error_status(&err);
            let response = match &self.error {
                Some(responder) => responder(status, &err),
                None => default_error_response(status, &err),
            };
            let _ = stream.set_write_timeout(self.handshake_timeout);
            let _ = stream.write_all(&response);
            let _ = stream.shutdown();
            return Err(err);
        }

        if !buffered.is_empty() {
            let _ = stream.shutdown();
            return Err(Error::DataBeforeHandshake);
        }

        let key = request
            .headers()
            .get("sec-websocket-key")
            .and_then(|value| value.to_str().ok())
            .expect("validated key");

        let subprotocol = self.select_subprotocol(request, response_headers);

        let compression = self.enable_compression
            && DeflateExt::from_offers(&parse_extensions(request.headers())).is_some();

        let mut response = Vec::with_capacity(256);
        response.extend_from_slice(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: ",
        );
        response.extend_from_slice(compute_accept_key(key).as_bytes());
        response.extend_from_slice(b"\r\n");
        if let Some(subprotocol) = &subprotocol {
            response.extend_from_slice(b"Sec-WebSocket-Protocol: ");
            response.extend_from_slice(subprotocol.as_bytes());
            response.extend_from_slice(b"\r\n");
        }
        if compression {
            response.extend_from_slice(b"Sec-WebSocket-Extensions: ");
            response.extend_from_slice(DeflateExt::no_context_takeover().to_string().as_bytes());
            response.extend_from_slice(b"\r\n");
        }
        if let Some(headers) = response_headers {
            for (name, value) in headers {
                if name.as_str() == "sec-websocket-protocol" {
                    continue;
                }
                response.extend_from_slice(name.as_str().as_bytes());
                response.extend_from_slice(b": ");
                for &byte in value.as_bytes() {
                    // replace CTLs to prevent response splitting
                    response.push(if byte <= 31 { b' ' } else { byte });
                }
                response.extend_from_slice(b"\r\n");
            }
        }
        response.extend_from_slice(b"\r\n");

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(self.handshake_timeout)?;
        if let Err(err) = stream.write_all(&response) {
            let _ = stream.shutdown();
            return Err(err.into());
        }
        stream.set_write_timeout(None)?;

        log::debug!(
            "accepted websocket upgrade, subprotocol={subprotocol:?} compression={compression}"
        );

        Ok(Conn::new(
            stream,
            ConnConfig {
                role: Role::Server,
                read_buffer_size: pick(self.read_buffer_size, DEFAULT_READ_BUFFER_SIZE),
                write_buffer_size: pick(self.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE),
                write_pool: self.write_buffer_pool.clone(),
                subprotocol,
                compression,
                buffered: buffered.to_vec(),
            },
        ))
    }

    fn validate(&self, request: &Request<()>, response_headers: Option<&HeaderMap>) -> Result<()> {
        if !header_list_contains_value(request.headers(), "connection", "upgrade") {
            return Err(Error::MissingConnectionUpgrade);
        }
        if !header_list_contains_value(request.headers(), "upgrade", "websocket") {
            return Err(Error::MissingUpgradeWebsocket);
        }
        if request.method() != Method::GET {
            return Err(Error::MethodNotGet);
        }
        if request
            .headers()
            .get("sec-websocket-version")
            .map(|value| value.as_bytes())
            != Some(b"13")
        {
            return Err(Error::UnsupportedVersion);
        }
        match request
            .headers()
            .get("sec-websocket-key")
            .and_then(|value| value.to_str().ok())
        {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(Error::MissingKey),
        }
        let origin_ok = match &self.check_origin {
            Some(check) => check(request),
            None => check_same_origin(request),
        };
        if !origin_ok {
            return Err(Error::OriginNotAllowed);
        }
        if response_headers
            .map(|headers| headers.contains_key("sec-websocket-extensions"))
            .unwrap_or(false)
        {
            return Err(Error::ExtensionsInResponseHeader);
        }
        Ok(())
    }

    // First client-offered token present in our list wins; without a
    // configured list, a caller-provided response header is used verbatim.
    fn select_subprotocol(
        &self,
        request: &Request<()>,
        response_headers: Option<&HeaderMap>,
    ) -> Option<String> {
        if !self.subprotocols.is_empty() {
            subprotocols(request)
                .into_iter()
                .find(|offered| self.subprotocols.iter().any(|have| have == offered))
        } else {
            response_headers?
                .get("sec-websocket-protocol")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        }
    }
}

fn pick(configured: usize, default: usize) -> usize {
    if configured == 0 {
        default
    } else {
        configured
    }
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::MethodNotGet => StatusCode::METHOD_NOT_ALLOWED,
        Error::OriginNotAllowed => StatusCode::FORBIDDEN,
        Error::ExtensionsInResponseHeader => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn default_error_response(status: StatusCode, err: &Error) -> Vec<u8> {
    let body = format!("{err}\n");
    let mut response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    );
    if matches!(err, Error::UnsupportedVersion) {
        response.push_str("Sec-WebSocket-Version: 13\r\n");
    }
    response.push_str("\r\n");
    response.push_str(&body);
    response.into_bytes()
}
