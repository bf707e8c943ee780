//! Blocking WebSocket implementation (RFC 6455) with the permessage-deflate
//! extension (RFC 7692, no-context-takeover mode only).
//!
//! The crate provides both roles of the protocol:
//!
//! - [`Upgrader`] turns a hijacked HTTP/1.1 byte stream into a [`Conn`] after
//!   validating the opening handshake.
//! - [`Dialer`] opens a client connection over TCP or TLS, optionally through
//!   an HTTP, HTTPS or SOCKS5 proxy.
//!
//! A [`Conn`] is a framed message transport over any [`Stream`]. The API is
//! synchronous: one thread may read ([`Conn::next_reader`],
//! [`Conn::read_message`]) while another writes ([`Conn::next_writer`],
//! [`Conn::write_message`]), and control frames can be injected from any
//! thread with [`Conn::write_control`]. Read and write deadlines are absolute
//! instants re-armed on the underlying stream before each I/O call.
//!
//! ```no_run
//! use websock::{Dialer, OpCode};
//!
//! fn main() -> websock::Result<()> {
//!     let dialer = Dialer::default();
//!     let (conn, _response) = dialer.dial("ws://echo.example.org/ws", None)?;
//!     conn.write_message(OpCode::Text, b"hello")?;
//!     let (opcode, payload) = conn.read_message()?;
//!     assert_eq!(opcode, OpCode::Text);
//!     assert_eq!(payload, b"hello");
//!     conn.close()
//! }
//! ```

mod client;
pub mod close;
mod compression;
mod conn;
pub mod frame;
mod key;
mod mask;
mod prepared;
pub mod proxy;
mod stream;
mod token;
mod upgrade;

#[cfg(test)]
pub(crate) mod testutil;

use std::io;

use thiserror::Error;

pub use client::{CookieJar, Dialer, NetDial, ProxyResolver};
pub use close::{format_close_message, CloseCode};
pub use conn::{BufferPool, CloseHandler, Conn, ControlHandler, MessageReader, MessageWriter};
pub use frame::OpCode;
pub use prepared::PreparedMessage;
pub use stream::{Stream, TlsStream};
pub use upgrade::{is_websocket_upgrade, subprotocols, ErrorResponder, OriginCheck, Upgrader};

/// A result type for WebSocket operations, using `Error` as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The role a connection plays. Client frames are masked on the wire,
/// server frames are not.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Errors surfaced by handshakes and by the framed transport.
///
/// The variants fall into a few families:
///
/// - Opening-handshake failures, server side (`MissingConnectionUpgrade`
///   through `DataBeforeHandshake`) and client side (`UnsupportedScheme`,
///   `BadHandshake`, the proxy variants).
/// - Protocol violations detected while reading frames. These terminate the
///   connection; where possible a close frame with an appropriate status code
///   is sent first.
/// - `Close`, the normal termination carrying the peer's status code and
///   reason.
/// - Usage errors (`ConcurrentWriter`, `CloseSent`, ...) which leave the
///   connection intact unless the caller persists.
/// - `Io`, propagated from the underlying stream; deadline expiry surfaces
///   here with `ErrorKind::WouldBlock` or `ErrorKind::TimedOut`.
#[derive(Error, Debug)]
pub enum Error {
    /// The request's `Connection` header has no `upgrade` token.
    #[error("connection header does not contain \"upgrade\" token")]
    MissingConnectionUpgrade,

    /// The request's `Upgrade` header has no `websocket` token.
    #[error("upgrade header does not contain \"websocket\" token")]
    MissingUpgradeWebsocket,

    /// The upgrade request used a method other than GET.
    #[error("request method is not GET")]
    MethodNotGet,

    /// `Sec-WebSocket-Version` is missing or not `13`.
    #[error("sec-websocket-version is not 13")]
    UnsupportedVersion,

    /// `Sec-WebSocket-Key` is missing or blank.
    #[error("sec-websocket-key is missing or blank")]
    MissingKey,

    /// The configured origin check rejected the request.
    #[error("request origin not allowed")]
    OriginNotAllowed,

    /// The application put `Sec-WebSocket-Extensions` in the response
    /// headers; extension negotiation is owned by the upgrader.
    #[error("application set sec-websocket-extensions header")]
    ExtensionsInResponseHeader,

    /// The client pipelined bytes behind the upgrade request.
    #[error("client sent data before handshake completion")]
    DataBeforeHandshake,

    /// The dial URL scheme is not `ws` or `wss`.
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    /// The dial or proxy URL failed to parse.
    #[error(transparent)]
    MalformedUrl(#[from] url::ParseError),

    /// A caller-supplied request header collides with one the handshake owns.
    #[error("forbidden handshake header: {0}")]
    ForbiddenHeader(String),

    /// The server's handshake response was not a valid `101` upgrade. The raw
    /// response is included so callers can inspect redirects, auth challenges
    /// and the like.
    #[error("bad handshake")]
    BadHandshake {
        response: Box<http::Response<Vec<u8>>>,
    },

    /// The peer's HTTP response could not be parsed.
    #[error("malformed http response: {0}")]
    MalformedResponse(#[from] httparse::Error),

    /// An HTTP proxy answered CONNECT with a non-2xx status.
    #[error("proxy refused connection: {0}")]
    ProxyConnect(String),

    /// A SOCKS5 proxy rejected the handshake or the connect request.
    #[error("socks5 proxy error (code {0})")]
    SocksReply(u8),

    /// A frame arrived with RSV2/RSV3 set, or RSV1 outside the first frame of
    /// a compressed message.
    #[error("reserved bits set without negotiated extension")]
    ReservedBits,

    /// The frame opcode is reserved.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame arrived with FIN=0.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A 64-bit extended payload length has its top bit set.
    #[error("invalid frame length")]
    InvalidFrameLength,

    /// Mask discipline violated: the server received an unmasked frame or the
    /// client received a masked one.
    #[error("incorrect mask flag for role")]
    BadMask,

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without preceding data frame")]
    InvalidContinuation,

    /// A new data frame arrived while a fragmented message was outstanding.
    #[error("data frame before final fragment of previous message")]
    NewMessageBeforeFin,

    /// A text message (or close reason) contained invalid UTF-8.
    #[error("invalid utf-8 payload")]
    InvalidUtf8,

    /// The message exceeded the configured read limit.
    #[error("read limit exceeded")]
    MessageTooLarge,

    /// A close frame carried a one-byte payload.
    #[error("invalid close frame payload")]
    InvalidCloseFrame,

    /// A close frame carried a status code that must not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    /// A compressed frame arrived but permessage-deflate was not negotiated.
    #[error("received compressed frame without negotiated compression")]
    CompressionNotNegotiated,

    /// The deflate stream did not end with the expected `00 00 FF FF`
    /// trailer, or was otherwise corrupt.
    #[error("corrupt deflate stream")]
    CorruptDeflateStream,

    /// The peer closed the connection; carries the close status code and the
    /// UTF-8 reason from the close frame payload.
    #[error("connection closed: code {code}, reason {reason:?}")]
    Close { code: u16, reason: String },

    /// The connection already failed; reads and writes are terminal.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Propagated from the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A second message writer was opened while one was live.
    #[error("concurrent message writer")]
    ConcurrentWriter,

    /// A write was attempted after a close frame was sent.
    #[error("close frame sent")]
    CloseSent,

    /// `write_control` was called with a non-control opcode.
    #[error("opcode is not a control opcode")]
    InvalidControlOpCode,

    /// `next_writer` was called with a non-data opcode.
    #[error("opcode is not a data opcode")]
    InvalidMessageOpCode,

    /// Compression level outside `[-2, 9]`.
    #[error("invalid compression level {0}")]
    InvalidCompressionLevel(i32),
}

impl Error {
    /// Returns the close status code and reason if this is a normal
    /// close-frame termination.
    pub fn close_frame(&self) -> Option<(u16, &str)> {
        match self {
            Error::Close { code, reason } => Some((*code, reason)),
            _ => None,
        }
    }

    /// True when the error is deadline expiry on the underlying stream.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Io(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}
