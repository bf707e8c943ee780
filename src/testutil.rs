//! In-memory duplex stream for tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::stream::{lock_ignore_poison as lock, Stream};

struct ChannelState {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState {
                buf: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }
}

/// One end of an in-memory duplex pipe. Writes never block; reads honor the
/// configured read timeout.
pub(crate) struct Pipe {
    incoming: Arc<Channel>,
    outgoing: Arc<Channel>,
    read_timeout: Mutex<Option<Duration>>,
}

pub(crate) fn pipe() -> (Pipe, Pipe) {
    let ab = Channel::new();
    let ba = Channel::new();
    (
        Pipe {
            incoming: Arc::clone(&ba),
            outgoing: Arc::clone(&ab),
            read_timeout: Mutex::new(None),
        },
        Pipe {
            incoming: ab,
            outgoing: ba,
            read_timeout: Mutex::new(None),
        },
    )
}

impl Pipe {
    /// Appends raw bytes to this end's incoming buffer, as if the peer had
    /// written them.
    pub(crate) fn inject_incoming(&self, bytes: &[u8]) {
        let mut state = lock(&self.incoming.state);
        state.buf.extend(bytes.iter().copied());
        self.incoming.cond.notify_all();
    }

    /// Unconsumed bytes waiting to be read by this end.
    pub(crate) fn peek_incoming(&self) -> Vec<u8> {
        lock(&self.incoming.state).buf.iter().copied().collect()
    }

    /// Bytes this end has written that the peer has not consumed yet.
    pub(crate) fn peek_outgoing(&self) -> Vec<u8> {
        lock(&self.outgoing.state).buf.iter().copied().collect()
    }
}

impl Stream for Pipe {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = *lock(&self.read_timeout);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.incoming.state);
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buf.pop_front().expect("non-empty buffer");
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(io::Error::new(io::ErrorKind::WouldBlock, "read timed out"));
                    }
                    self.incoming
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
                None => self
                    .incoming
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.outgoing.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(buf.iter().copied());
        self.outgoing.cond.notify_all();
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *lock(&self.read_timeout) = timeout;
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        for channel in [&self.incoming, &self.outgoing] {
            lock(&channel.state).closed = true;
            channel.cond.notify_all();
        }
        Ok(())
    }
}
