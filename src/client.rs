//! Client side of the opening handshake.
//!
//! [`Dialer`] opens the transport (directly or through a proxy), emits a
//! literal HTTP/1.1 upgrade request, parses the response and hands back a
//! [`Conn`] in the client role together with the raw response.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderMap, Response};
use url::Url;

use crate::compression::DeflateExt;
use crate::conn::{BufferPool, Conn, ConnConfig, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use crate::key::{compute_accept_key, generate_challenge_key};
use crate::proxy;
use crate::stream::{default_tls_config, Stream, TlsStream};
use crate::token::header_list_contains_value;
use crate::{Error, Result, Role};

/// Pluggable transport dialer: maps `host:port` to an established stream.
pub type NetDial = Arc<dyn Fn(&str) -> io::Result<Box<dyn Stream>> + Send + Sync>;

/// Maps the request URL to a proxy URL; `None` means dial directly.
pub type ProxyResolver = Box<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

/// Cookie storage consulted on each dial: cookies for the URL are sent with
/// the request, and `Set-Cookie` response values are stored back.
pub trait CookieJar: Send + Sync {
    /// `name=value` pairs to send for this URL.
    fn cookies(&self, url: &Url) -> Vec<String>;
    /// Records `Set-Cookie` header values from the handshake response.
    fn set_cookies(&self, url: &Url, cookies: &[String]);
}

/// Opens client WebSocket connections.
///
/// `Dialer::default()` dials over TCP (and TLS for `wss`) with no proxy and
/// no compression.
pub struct Dialer {
    /// Dialer for the plain transport. Defaults to a TCP connect honoring
    /// the handshake deadline.
    pub net_dial: Option<NetDial>,

    /// Dialer producing an already-TLS-established stream. Takes precedence
    /// for `wss` targets without a proxy and for `https` proxies; ignored
    /// otherwise.
    pub net_dial_tls: Option<NetDial>,

    /// TLS parameters for handshakes this dialer performs itself; the server
    /// name is the target host.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Total deadline across dial, request write and response read.
    pub handshake_timeout: Option<Duration>,

    /// I/O buffer sizes; zero selects the 4096-byte default.
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    /// Optional source of write buffers shared between connections.
    pub write_buffer_pool: Option<Arc<dyn BufferPool>>,

    /// Subprotocols offered in the request, in preference order.
    pub subprotocols: Vec<String>,

    /// Offer `permessage-deflate`.
    pub enable_compression: bool,

    /// Optional cookie jar, read on request and written on response.
    pub jar: Option<Arc<dyn CookieJar>>,

    /// Per-dial proxy resolver.
    pub proxy: Option<ProxyResolver>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            net_dial: None,
            net_dial_tls: None,
            tls_config: None,
            handshake_timeout: None,
            read_buffer_size: 0,
            write_buffer_size: 0,
            write_buffer_pool: None,
            subprotocols: Vec::new(),
            enable_compression: false,
            jar: None,
            proxy: None,
        }
    }
}

impl Dialer {
    /// Dials `url` (`ws://` or `wss://`) and performs the opening handshake.
    ///
    /// Returns the connection and the server's handshake response. On a
    /// non-101 response or a mismatched accept key the raw response travels
    /// inside [`Error::BadHandshake`] for inspection.
    pub fn dial(
        &self,
        url: &str,
        request_headers: Option<&HeaderMap>,
    ) -> Result<(Conn<Box<dyn Stream>>, Response<Vec<u8>>)> {
        let url = Url::parse(url)?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(Error::UnsupportedScheme(other.to_owned())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::UnsupportedScheme("missing host".to_owned()))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });
        let host_port = format!("{host}:{port}");

        if let Some(headers) = request_headers {
            validate_request_headers(headers)?;
        }

        let deadline = self.handshake_timeout.map(|timeout| Instant::now() + timeout);

        let stream = self.open_stream(&url, secure, &host, &host_port, deadline)?;
        stream.set_read_timeout(remaining(deadline)?)?;
        stream.set_write_timeout(remaining(deadline)?)?;

        let challenge_key = generate_challenge_key();
        let request = self.format_request(&url, &host, challenge_key.as_str(), request_headers);
        stream.write_all(&request)?;

        let (response, leftover) = read_response(&stream, deadline)?;

        if let (Some(jar), cookies) = (self.jar.as_ref(), response.headers().get_all(http::header::SET_COOKIE)) {
            let values: Vec<String> = cookies
                .iter()
                .filter_map(|value| value.to_str().ok().map(str::to_owned))
                .collect();
            if !values.is_empty() {
                jar.set_cookies(&url, &values);
            }
        }

        let expected_accept = compute_accept_key(&challenge_key);
        let accept_ok = response
            .headers()
            .get("sec-websocket-accept")
            .and_then(|value| value.to_str().ok())
            == Some(expected_accept.as_str());
        if response.status() != http::StatusCode::SWITCHING_PROTOCOLS
            || !header_list_contains_value(response.headers(), "upgrade", "websocket")
            || !header_list_contains_value(response.headers(), "connection", "upgrade")
            || !accept_ok
        {
            let _ = stream.shutdown();
            return Err(Error::BadHandshake {
                response: Box::new(response),
            });
        }

        let subprotocol = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let compression = self.enable_compression
            && response
                .headers()
                .get("sec-websocket-extensions")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().starts_with("permessage-deflate"))
                .unwrap_or(false);

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        log::debug!("websocket handshake complete with {host_port}, compression={compression}");

        let conn = Conn::new(
            stream,
            ConnConfig {
                role: Role::Client,
                read_buffer_size: pick(self.read_buffer_size, DEFAULT_READ_BUFFER_SIZE),
                write_buffer_size: pick(self.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE),
                write_pool: self.write_buffer_pool.clone(),
                subprotocol,
                compression,
                buffered: leftover,
            },
        );
        Ok((conn, response))
    }

    fn open_stream(
        &self,
        url: &Url,
        secure: bool,
        host: &str,
        host_port: &str,
        deadline: Option<Instant>,
    ) -> Result<Box<dyn Stream>> {
        if let Some(proxy_url) = self.proxy.as_ref().and_then(|resolve| resolve(url)) {
            let ctx = proxy::ProxyDialContext::new(
                self.net_dial.clone(),
                self.net_dial_tls.clone(),
                self.tls_client_config(),
                deadline,
            );
            let tunnel = proxy::dial_via_proxy(&proxy_url, &ctx, host_port)?;
            return if secure {
                // backend TLS handshake runs over the tunnel
                Ok(Box::new(TlsStream::client(
                    tunnel,
                    self.tls_client_config(),
                    host,
                )?))
            } else {
                Ok(tunnel)
            };
        }

        if secure {
            if let Some(dial_tls) = &self.net_dial_tls {
                return Ok(dial_tls(host_port)?);
            }
            let plain = match &self.net_dial {
                Some(dial) => dial(host_port)?,
                None => default_dial(host_port, deadline)?,
            };
            return Ok(Box::new(TlsStream::client(
                plain,
                self.tls_client_config(),
                host,
            )?));
        }

        match &self.net_dial {
            Some(dial) => Ok(dial(host_port)?),
            None => Ok(default_dial(host_port, deadline)?),
        }
    }

    fn tls_client_config(&self) -> Arc<rustls::ClientConfig> {
        self.tls_config.clone().unwrap_or_else(default_tls_config)
    }

    fn format_request(
        &self,
        url: &Url,
        host: &str,
        challenge_key: &str,
        request_headers: Option<&HeaderMap>,
    ) -> Vec<u8> {
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let host_header = match request_headers.and_then(|headers| headers.get(http::header::HOST)) {
            Some(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
            None => match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            },
        };

        let mut request = format!(
            "GET {target} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {challenge_key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if !self.subprotocols.is_empty() {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(&self.subprotocols.join(", "));
            request.push_str("\r\n");
        }
        if self.enable_compression {
            request.push_str("Sec-WebSocket-Extensions: ");
            request.push_str(&DeflateExt::no_context_takeover().to_string());
            request.push_str("\r\n");
        }
        if let Some(jar) = &self.jar {
            let cookies = jar.cookies(url);
            if !cookies.is_empty() {
                request.push_str("Cookie: ");
                request.push_str(&cookies.join("; "));
                request.push_str("\r\n");
            }
        }
        if let Some(headers) = request_headers {
            for (name, value) in headers {
                if name == &http::header::HOST {
                    continue;
                }
                request.push_str(name.as_str());
                request.push_str(": ");
                request.push_str(&String::from_utf8_lossy(value.as_bytes()));
                request.push_str("\r\n");
            }
        }
        request.push_str("\r\n");
        request.into_bytes()
    }
}

// Headers the handshake owns may not be supplied by the caller; Host is the
// exception and overrides the derived value.
fn validate_request_headers(headers: &HeaderMap) -> Result<()> {
    for name in headers.keys() {
        let name_str = name.as_str();
        if name_str == "upgrade"
            || name_str == "connection"
            || name_str.starts_with("sec-websocket-")
        {
            return Err(Error::ForbiddenHeader(name_str.to_owned()));
        }
    }
    Ok(())
}

fn pick(configured: usize, default: usize) -> usize {
    if configured == 0 {
        default
    } else {
        configured
    }
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake deadline exceeded",
                )));
            }
            Ok(Some(deadline - now))
        }
        None => Ok(None),
    }
}

pub(crate) fn default_dial(addr: &str, deadline: Option<Instant>) -> io::Result<Box<dyn Stream>> {
    let stream = match deadline {
        Some(deadline) => {
            let mut last_err = None;
            let mut connected = None;
            for sock_addr in addr.to_socket_addrs()? {
                let now = Instant::now();
                if deadline <= now {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "dial deadline exceeded",
                    ));
                }
                match TcpStream::connect_timeout(&sock_addr, deadline - now) {
                    Ok(stream) => {
                        connected = Some(stream);
                        break;
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            match connected {
                Some(stream) => stream,
                None => {
                    return Err(last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "no addresses to dial")
                    }))
                }
            }
        }
        None => TcpStream::connect(addr)?,
    };
    let _ = stream.set_nodelay(true);
    Ok(Box::new(stream))
}

// Reads and parses one HTTP/1.1 response head, returning the response (with
// any readable error body) and the bytes read beyond it.
fn read_response<S: Stream>(
    stream: &S,
    deadline: Option<Instant>,
) -> Result<(Response<Vec<u8>>, Vec<u8>)> {
    const MAX_HEAD: usize = 64 * 1024;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        stream.set_read_timeout(remaining(deadline)?)?;
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&buf)? {
            httparse::Status::Complete(head_len) => {
                let status = parsed.code.expect("complete response has status");
                let mut builder = Response::builder().status(status);
                for header in parsed.headers.iter() {
                    builder = builder.header(header.name, header.value);
                }

                let content_length = parsed
                    .headers
                    .iter()
                    .find(|header| header.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|header| std::str::from_utf8(header.value).ok())
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);

                let mut leftover = buf.split_off(head_len);
                let mut body = Vec::new();
                if status != 101 {
                    body = read_error_body(stream, content_length, &mut leftover, deadline);
                }

                let response = builder
                    .body(body)
                    .map_err(|err| Error::Io(io::Error::other(err)))?;
                return Ok((response, leftover));
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response header block too large",
                    )));
                }
            }
        }
    }
}

// Best-effort body capture for non-101 responses so callers can see what the
// server said.
fn read_error_body(
    stream: &dyn Stream,
    content_length: usize,
    leftover: &mut Vec<u8>,
    deadline: Option<Instant>,
) -> Vec<u8> {
    const MAX_BODY: usize = 16 * 1024;
    let content_length = content_length.min(MAX_BODY);

    let mut body = std::mem::take(leftover);
    if content_length == 0 {
        body.truncate(MAX_BODY);
        return body;
    }
    body.truncate(content_length);
    let mut chunk = [0u8; 1024];
    while body.len() < content_length {
        if stream.set_read_timeout(remaining(deadline).ok().flatten()).is_err() {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let take = n.min(content_length - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
        }
    }
    body
}
