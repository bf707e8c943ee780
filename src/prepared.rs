//! Pre-encoded messages for broadcast fan-out.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::compression::Deflater;
use crate::frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
use crate::mask::apply_mask;
use crate::stream::lock_ignore_poison as lock;
use crate::{Error, Result};

/// Frame-affecting connection settings a prepared frame is keyed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PrepareKey {
    pub(crate) server: bool,
    pub(crate) compress: bool,
    pub(crate) level: i32,
}

/// An immutable message whose framed bytes are computed once per
/// `(role, compression, level)` combination and then shared.
///
/// Useful when the same payload goes to many connections: the framing (and
/// compression) work is done once instead of per recipient. Send with
/// [`Conn::write_prepared`](crate::Conn::write_prepared).
pub struct PreparedMessage {
    opcode: OpCode,
    payload: Vec<u8>,
    cache: Mutex<HashMap<PrepareKey, Bytes>>,
}

impl PreparedMessage {
    /// Prepares a message. Continuation frames cannot be prepared; control
    /// payloads are bounded at 125 bytes.
    pub fn new(opcode: OpCode, payload: &[u8]) -> Result<Self> {
        if opcode == OpCode::Continuation {
            return Err(Error::InvalidMessageOpCode);
        }
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFrameTooLarge);
        }
        Ok(Self {
            opcode,
            payload: payload.to_vec(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub(crate) fn frame(&self, key: PrepareKey) -> Result<Bytes> {
        if let Some(cached) = lock(&self.cache).get(&key) {
            return Ok(cached.clone());
        }

        // built outside the lock; racing builders converge on one entry
        let compress = key.compress && self.opcode.is_data();
        let mut body = if compress {
            let mut out = Vec::new();
            let mut deflater = Deflater::acquire(key.level);
            deflater.write(&self.payload, &mut |chunk| {
                out.extend_from_slice(chunk);
                Ok(())
            })?;
            deflater.finish(&mut |chunk| {
                out.extend_from_slice(chunk);
                Ok(())
            })?;
            out
        } else {
            self.payload.clone()
        };

        let mask = (!key.server).then(rand::random::<[u8; 4]>);
        let header = FrameHeader {
            fin: true,
            rsv1: compress,
            opcode: self.opcode,
            mask,
            payload_len: body.len() as u64,
        };
        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = header.format(&mut head);
        if let Some(key) = mask {
            apply_mask(&mut body, key, 0);
        }

        let mut frame = Vec::with_capacity(head_len + body.len());
        frame.extend_from_slice(&head[..head_len]);
        frame.extend_from_slice(&body);
        let frame = Bytes::from(frame);

        let cached = lock(&self.cache)
            .entry(key)
            .or_insert_with(|| frame.clone())
            .clone();
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_is_cached_per_key() {
        let message = PreparedMessage::new(OpCode::Text, b"cached").unwrap();
        let key = PrepareKey {
            server: true,
            compress: false,
            level: 1,
        };
        let first = message.frame(key).unwrap();
        let second = message.frame(key).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());

        let other = message
            .frame(PrepareKey {
                server: false,
                ..key
            })
            .unwrap();
        assert_ne!(first.as_ptr(), other.as_ptr());
    }

    #[test]
    fn test_server_frame_layout() {
        let message = PreparedMessage::new(OpCode::Text, b"abc").unwrap();
        let frame = message
            .frame(PrepareKey {
                server: true,
                compress: false,
                level: 1,
            })
            .unwrap();
        assert_eq!(&frame[..], &[0x81, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_client_frame_is_masked() {
        let message = PreparedMessage::new(OpCode::Binary, b"abcd").unwrap();
        let frame = message
            .frame(PrepareKey {
                server: false,
                compress: false,
                level: 1,
            })
            .unwrap();
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1], 0x80 | 4);
        let key = [frame[2], frame[3], frame[4], frame[5]];
        let mut body = frame[6..].to_vec();
        apply_mask(&mut body, key, 0);
        assert_eq!(body, b"abcd");
    }

    #[test]
    fn test_oversized_control_payload_rejected() {
        let payload = vec![0u8; 126];
        assert!(matches!(
            PreparedMessage::new(OpCode::Ping, &payload),
            Err(Error::ControlFrameTooLarge)
        ));
        assert!(matches!(
            PreparedMessage::new(OpCode::Continuation, b""),
            Err(Error::InvalidMessageOpCode)
        ));
    }

    #[test]
    fn test_compressed_frame_sets_rsv1() {
        let message = PreparedMessage::new(OpCode::Text, b"compress me please").unwrap();
        let frame = message
            .frame(PrepareKey {
                server: true,
                compress: true,
                level: 1,
            })
            .unwrap();
        assert_eq!(frame[0], 0x81 | 0x40);
    }
}
