//! Close status codes and close-frame payload helpers (RFC 6455 §5.5.1, §7.4).

use crate::{Error, Result};

/// Close status codes defined in RFC 6455 section 7.4.1.
///
/// `NoStatus`, `Abnormal` and `TlsHandshake` are reporting codes only and
/// must never appear in a close frame on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint is going away.
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: unsupported data type.
    Unsupported,
    /// 1005: no status code was present (never sent on the wire).
    NoStatus,
    /// 1006: abnormal closure (never sent on the wire).
    Abnormal,
    /// 1007: payload data was inconsistent with the message type.
    Invalid,
    /// 1008: message violates endpoint policy.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected an extension the server did not negotiate.
    Extension,
    /// 1011: server encountered an unexpected condition.
    Error,
    /// 1015: TLS handshake failure (never sent on the wire).
    TlsHandshake,
    /// 3000-4999: codes registered with IANA or reserved for private use.
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1015 => Self::TlsHandshake,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(other) => other,
        }
    }
}

/// Returns true if `code` may be carried by a close frame received from the
/// peer: 1000-1003, 1007-1011 and the registered/private range 3000-4999.
pub(crate) fn is_valid_received_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Encodes a close frame payload: two bytes of big-endian status code
/// followed by the UTF-8 reason. An empty payload (no status at all) is
/// produced by [`CloseCode::NoStatus`].
pub fn format_close_message(code: CloseCode, reason: &str) -> Vec<u8> {
    if code == CloseCode::NoStatus {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Decodes a received close frame payload into `(code, reason)`.
///
/// An empty payload means no status was received (1005). A one-byte payload
/// and a non-UTF-8 reason are protocol errors, as is a status code that must
/// not appear on the wire.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<(u16, String)> {
    match payload.len() {
        0 => Ok((u16::from(CloseCode::NoStatus), String::new())),
        1 => Err(Error::InvalidCloseFrame),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_received_close_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
            Ok((code, reason.to_owned()))
        }
    }
}
