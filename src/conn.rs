//! Connection state and streaming message I/O.
//!
//! A [`Conn`] owns the byte stream after a successful handshake and exposes
//! message-boundary reads and writes. One thread may read while another
//! writes; [`Conn::write_control`] and [`Conn::close`] are additionally safe
//! from any thread because every frame reaches the wire as one unit under an
//! internal lock.
//!
//! The read path consumes control frames internally: pings answer themselves
//! with a pong, pongs run an optional handler, and a close frame runs the
//! close handler and then surfaces [`Error::Close`] from the current and all
//! subsequent reads. Text messages are UTF-8 validated incrementally across
//! fragments; compressed messages are inflated transparently when
//! permessage-deflate was negotiated.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::close::{self, CloseCode};
use crate::compression::{
    is_valid_compression_level, Deflater, Inflater, DEFAULT_COMPRESSION_LEVEL,
};
use crate::frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
use crate::mask::apply_mask;
use crate::stream::{lock_ignore_poison as lock, Stream};
use crate::{Error, Result, Role};

pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub(crate) const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Buffers below this are rounded up; the write buffer additionally reserves
/// header space so a control-sized payload always fits in one frame.
const MIN_BUFFER_SIZE: usize = 256;

/// Base unit for internal best-effort writes (close echoes, error closes).
const WRITE_WAIT: Duration = Duration::from_secs(1);

/// Deadline used by the default ping handler when answering with a pong.
const PONG_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Handler invoked with a ping or pong payload on the reader thread.
pub type ControlHandler = Box<dyn FnMut(&[u8]) -> Result<()> + Send>;

/// Handler invoked with the peer's close code and reason on the reader
/// thread. An [`Error::Close`] returned here propagates verbatim out of the
/// read call.
pub type CloseHandler = Box<dyn FnMut(u16, &str) -> Result<()> + Send>;

/// Source of write buffers shared between connections. Buffers handed back
/// are cleared before reuse.
pub trait BufferPool: Send + Sync {
    fn get(&self) -> Option<Vec<u8>>;
    fn put(&self, buf: Vec<u8>);
}

/// Construction parameters shared by the upgrader and the dialer.
pub(crate) struct ConnConfig {
    pub(crate) role: Role,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) write_pool: Option<Arc<dyn BufferPool>>,
    pub(crate) subprotocol: Option<String>,
    pub(crate) compression: bool,
    /// Bytes already pulled off the stream during the handshake.
    pub(crate) buffered: Vec<u8>,
}

// ================== sticky errors ====================

// Read/write failures are remembered in a reproducible form so later calls
// keep failing without holding a non-cloneable error value.
enum ReadSticky {
    Close { code: u16, reason: String },
    Broken,
}

impl ReadSticky {
    fn to_error(&self) -> Error {
        match self {
            ReadSticky::Close { code, reason } => Error::Close {
                code: *code,
                reason: reason.clone(),
            },
            ReadSticky::Broken => Error::ConnectionClosed,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WriteSticky {
    CloseSent,
    Broken,
}

impl WriteSticky {
    fn to_error(self) -> Error {
        match self {
            WriteSticky::CloseSent => Error::CloseSent,
            WriteSticky::Broken => Error::ConnectionClosed,
        }
    }
}

// ================== wire lock ====================

// Serializes whole-frame writes. Unlike a plain mutex, acquisition honors a
// deadline so `write_control` keeps its timeout while a data frame is on the
// wire.
struct WireLock {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl WireLock {
    fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, deadline: Option<Instant>) -> Result<WireGuard<'_>> {
        let mut locked = lock(&self.locked);
        while *locked {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timeout acquiring frame lock",
                        )));
                    }
                    locked = self
                        .cond
                        .wait_timeout(locked, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
                None => {
                    locked = self
                        .cond
                        .wait(locked)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
        *locked = true;
        Ok(WireGuard(self))
    }
}

struct WireGuard<'a>(&'a WireLock);

impl Drop for WireGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.locked) = false;
        self.0.cond.notify_one();
    }
}

// ================== read-side state ====================

struct ReadBuffer {
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl ReadBuffer {
    fn new(capacity: usize, initial: Vec<u8>) -> Self {
        let capacity = capacity.max(MIN_BUFFER_SIZE).max(initial.len());
        let mut buf = vec![0u8; capacity].into_boxed_slice();
        buf[..initial.len()].copy_from_slice(&initial);
        Self {
            buf,
            pos: 0,
            len: initial.len(),
        }
    }

    fn buffered(&self) -> usize {
        self.len - self.pos
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffered());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

struct Handlers {
    ping: Option<ControlHandler>,
    pong: Option<ControlHandler>,
    close: Option<CloseHandler>,
}

struct ReadState {
    buf: ReadBuffer,
    limit: Option<u64>,
    /// Payload bytes left in the frame being consumed.
    remaining: u64,
    /// FIN of the frame being consumed; true between messages.
    final_frame: bool,
    mask_key: Option<[u8; 4]>,
    mask_pos: usize,
    /// Bumped whenever a new message starts or ends; a `MessageReader`
    /// carrying an older value reads end-of-stream.
    seq: u64,
    /// Total payload length of the message being read, for the limit.
    message_length: u64,
    sticky: Option<ReadSticky>,
    handlers: Handlers,
}

/// What `advance_frame` found.
enum Advanced {
    /// First frame of a data message (opcode, compressed).
    Start(OpCode, bool),
    /// A continuation or an internally handled control frame.
    Other,
}

/// One `read_chunk` outcome. `Superseded` is kept distinct from `End` so a
/// stale reader cannot be mistaken for a finished message; only a genuine
/// `End` may trigger end-of-message work such as UTF-8 finalization.
enum ChunkRead {
    Data(usize),
    /// The FIN frame of the message has been fully consumed.
    End,
    /// A later `next_reader` call took over the message stream.
    Superseded,
}

// ================== Conn ====================

/// A WebSocket connection over a [`Stream`].
///
/// Created by [`Upgrader::upgrade`](crate::Upgrader::upgrade) (server role)
/// or [`Dialer::dial`](crate::Dialer::dial) (client role). The connection
/// supports one concurrent reader and one concurrent writer; control frames
/// and [`Conn::close`] may be issued from any thread.
pub struct Conn<S> {
    stream: S,
    role: Role,
    subprotocol: Option<String>,
    compression: bool,

    read: Mutex<ReadState>,
    read_deadline: Mutex<Option<Instant>>,

    wire: WireLock,
    write_sticky: Mutex<Option<WriteSticky>>,
    write_deadline: Mutex<Option<Instant>>,
    write_buffer_size: usize,
    write_pool: Option<Arc<dyn BufferPool>>,
    writer_active: AtomicBool,
    write_compression: AtomicBool,
    compression_level: AtomicI32,

    shutdown_done: AtomicBool,
}

impl<S> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("subprotocol", &self.subprotocol)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl<S: Stream> Conn<S> {
    pub(crate) fn new(stream: S, config: ConnConfig) -> Self {
        Self {
            stream,
            role: config.role,
            subprotocol: config.subprotocol,
            compression: config.compression,
            read: Mutex::new(ReadState {
                buf: ReadBuffer::new(config.read_buffer_size, config.buffered),
                limit: None,
                remaining: 0,
                final_frame: true,
                mask_key: None,
                mask_pos: 0,
                seq: 0,
                message_length: 0,
                sticky: None,
                handlers: Handlers {
                    ping: None,
                    pong: None,
                    close: None,
                },
            }),
            read_deadline: Mutex::new(None),
            wire: WireLock::new(),
            write_sticky: Mutex::new(None),
            write_deadline: Mutex::new(None),
            write_buffer_size: config.write_buffer_size.max(MIN_BUFFER_SIZE),
            write_pool: config.write_pool,
            writer_active: AtomicBool::new(false),
            write_compression: AtomicBool::new(true),
            compression_level: AtomicI32::new(DEFAULT_COMPRESSION_LEVEL),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// The role this end plays.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The subprotocol negotiated during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    // ================== deadlines and limits ====================

    /// Arms the read deadline. Reads past `deadline` fail and leave the read
    /// side unusable. `None` disables the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.read_deadline) = deadline;
    }

    /// Arms the write deadline, covering data frames written after this call.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.write_deadline) = deadline;
    }

    /// Caps the total payload size of a received message, across fragments.
    /// An oversized message closes the connection with status 1009.
    pub fn set_read_limit(&self, limit: Option<u64>) {
        lock(&self.read).limit = limit;
    }

    /// Replaces the ping handler; `None` restores the default, which answers
    /// with a pong carrying the same payload.
    pub fn set_ping_handler(&self, handler: Option<ControlHandler>) {
        lock(&self.read).handlers.ping = handler;
    }

    /// Replaces the pong handler; the default does nothing.
    pub fn set_pong_handler(&self, handler: Option<ControlHandler>) {
        lock(&self.read).handlers.pong = handler;
    }

    /// Replaces the close handler; the default echoes a close frame with the
    /// peer's status code and an empty reason.
    pub fn set_close_handler(&self, handler: Option<CloseHandler>) {
        lock(&self.read).handlers.close = handler;
    }

    /// Toggles compression for messages written after this call. Has no
    /// effect unless permessage-deflate was negotiated.
    pub fn enable_write_compression(&self, enable: bool) {
        self.write_compression.store(enable, Ordering::Relaxed);
    }

    /// Sets the deflate level for subsequent messages, in `[-2, 9]`.
    pub fn set_compression_level(&self, level: i32) -> Result<()> {
        if !is_valid_compression_level(level) {
            return Err(Error::InvalidCompressionLevel(level));
        }
        self.compression_level.store(level, Ordering::Relaxed);
        Ok(())
    }

    fn arm_read_timeout(&self) -> Result<()> {
        let timeout = match *lock(&self.read_deadline) {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    )));
                }
                Some(deadline - now)
            }
            None => None,
        };
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn arm_write_timeout(&self, deadline: Option<Instant>) -> Result<()> {
        let deadline = deadline.or(*lock(&self.write_deadline));
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write deadline exceeded",
                    )));
                }
                Some(deadline - now)
            }
            None => None,
        };
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    // ================== read path ====================

    /// Waits for the next data message and returns its opcode together with a
    /// reader over the payload, which streams across continuation frames
    /// until FIN. Control frames arriving in between are handled internally.
    ///
    /// Calling `next_reader` again before draining the current message
    /// discards its remainder.
    pub fn next_reader(&self) -> Result<(OpCode, MessageReader<'_, S>)> {
        let mut st = lock(&self.read);
        let st = &mut *st;

        // supersede any reader still holding the previous message
        st.seq = st.seq.wrapping_add(1);
        st.message_length = 0;

        loop {
            if let Some(sticky) = &st.sticky {
                return Err(sticky.to_error());
            }
            match self.advance_frame(st) {
                Ok(Advanced::Start(opcode, compressed)) => {
                    let inflater = compressed.then(Inflater::acquire);
                    let utf8 = (opcode == OpCode::Text).then(Utf8Validator::default);
                    return Ok((
                        opcode,
                        MessageReader {
                            conn: self,
                            seq: st.seq,
                            inflater,
                            utf8,
                            done: false,
                        },
                    ));
                }
                Ok(Advanced::Other) => continue,
                Err(err) => {
                    if st.sticky.is_none() {
                        st.sticky = Some(ReadSticky::Broken);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Reads the next data message to completion.
    pub fn read_message(&self) -> Result<(OpCode, Vec<u8>)> {
        let (opcode, mut reader) = self.next_reader()?;
        let mut payload = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = reader.read_inner(&mut chunk)?;
            if n == 0 {
                break;
            }
            payload.extend_from_slice(&chunk[..n]);
        }
        Ok((opcode, payload))
    }

    // True once a later `next_reader` call has taken over the message
    // stream from the reader identified by `seq`.
    fn reader_superseded(&self, seq: u64) -> bool {
        lock(&self.read).seq != seq
    }

    // Serves payload bytes of the current message to the reader identified by
    // `seq`.
    fn read_chunk(&self, seq: u64, out: &mut [u8]) -> Result<ChunkRead> {
        if out.is_empty() {
            return Ok(ChunkRead::Data(0));
        }
        let mut st = lock(&self.read);
        let st = &mut *st;
        if st.seq != seq {
            return Ok(ChunkRead::Superseded);
        }
        loop {
            if st.remaining > 0 {
                return match self.read_payload(st, out) {
                    Ok(n) => Ok(ChunkRead::Data(n)),
                    Err(err) => {
                        if st.sticky.is_none() {
                            st.sticky = Some(ReadSticky::Broken);
                        }
                        Err(err)
                    }
                };
            }
            if st.final_frame {
                // message complete; retire the reader
                st.seq = st.seq.wrapping_add(1);
                return Ok(ChunkRead::End);
            }
            match self.advance_frame(st) {
                Ok(_) => continue,
                Err(err) => {
                    if st.sticky.is_none() {
                        st.sticky = Some(ReadSticky::Broken);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn read_payload(&self, st: &mut ReadState, out: &mut [u8]) -> Result<usize> {
        let want = out.len().min(st.remaining.min(usize::MAX as u64) as usize);
        if st.buf.buffered() == 0 {
            if want >= st.buf.capacity() {
                // large frame: bypass the buffer
                self.arm_read_timeout()?;
                let n = self.stream.read(&mut out[..want])?;
                if n == 0 {
                    return Err(unexpected_eof());
                }
                if let Some(key) = st.mask_key {
                    st.mask_pos = apply_mask(&mut out[..n], key, st.mask_pos);
                }
                st.remaining -= n as u64;
                return Ok(n);
            }
            if self.fill_buf(st)? == 0 {
                return Err(unexpected_eof());
            }
        }
        let n = st.buf.take(&mut out[..want]);
        if let Some(key) = st.mask_key {
            st.mask_pos = apply_mask(&mut out[..n], key, st.mask_pos);
        }
        st.remaining -= n as u64;
        Ok(n)
    }

    fn fill_buf(&self, st: &mut ReadState) -> Result<usize> {
        if st.buf.pos == st.buf.len {
            st.buf.pos = 0;
            st.buf.len = 0;
        }
        self.arm_read_timeout()?;
        let n = self.stream.read(&mut st.buf.buf[st.buf.len..])?;
        st.buf.len += n;
        Ok(n)
    }

    fn read_exact(&self, st: &mut ReadState, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if st.buf.buffered() == 0 && self.fill_buf(st)? == 0 {
                return Err(unexpected_eof());
            }
            filled += st.buf.take(&mut out[filled..]);
        }
        Ok(())
    }

    fn discard(&self, st: &mut ReadState, mut n: u64) -> Result<()> {
        while n > 0 {
            let buffered = st.buf.buffered();
            if buffered == 0 {
                if self.fill_buf(st)? == 0 {
                    return Err(unexpected_eof());
                }
                continue;
            }
            let skip = (n.min(buffered as u64)) as usize;
            st.buf.pos += skip;
            n -= skip as u64;
        }
        Ok(())
    }

    // Reads the next frame header, consuming control frames internally.
    fn advance_frame(&self, st: &mut ReadState) -> Result<Advanced> {
        // skip whatever is left of the frame being abandoned
        let leftover = st.remaining;
        st.remaining = 0;
        self.discard(st, leftover)?;

        let mut head = [0u8; 2];
        self.read_exact(st, &mut head)?;

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        if head[0] & 0x30 != 0 {
            return Err(self.protocol_violation(Error::ReservedBits));
        }
        let opcode = match OpCode::try_from(head[0] & 0x0F) {
            Ok(opcode) => opcode,
            Err(err) => return Err(self.protocol_violation(err)),
        };

        let masked = head[1] & 0x80 != 0;
        if masked != (self.role == Role::Server) {
            return Err(self.protocol_violation(Error::BadMask));
        }

        let mut length = u64::from(head[1] & 0x7F);
        match length {
            126 => {
                let mut ext = [0u8; 2];
                self.read_exact(st, &mut ext)?;
                length = u64::from(u16::from_be_bytes(ext));
            }
            127 => {
                let mut ext = [0u8; 8];
                self.read_exact(st, &mut ext)?;
                length = u64::from_be_bytes(ext);
                if length & (1 << 63) != 0 {
                    return Err(self.protocol_violation(Error::InvalidFrameLength));
                }
            }
            _ => {}
        }

        let mask_key = if masked {
            let mut key = [0u8; 4];
            self.read_exact(st, &mut key)?;
            Some(key)
        } else {
            None
        };

        if opcode.is_control() {
            if rsv1 {
                return Err(self.protocol_violation(Error::ReservedBits));
            }
            if !fin {
                return Err(self.protocol_violation(Error::ControlFrameFragmented));
            }
            if length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(self.protocol_violation(Error::ControlFrameTooLarge));
            }
            let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
            let payload = &mut payload[..length as usize];
            self.read_exact(st, payload)?;
            if let Some(key) = mask_key {
                apply_mask(payload, key, 0);
            }
            self.on_control(st, opcode, payload)?;
            return Ok(Advanced::Other);
        }

        // data frame sequencing
        let start = match opcode {
            OpCode::Continuation => {
                if st.final_frame {
                    return Err(self.protocol_violation(Error::InvalidContinuation));
                }
                if rsv1 {
                    return Err(self.protocol_violation(Error::ReservedBits));
                }
                false
            }
            _ => {
                if !st.final_frame {
                    return Err(self.protocol_violation(Error::NewMessageBeforeFin));
                }
                if rsv1 && !self.compression {
                    return Err(self.protocol_violation(Error::CompressionNotNegotiated));
                }
                true
            }
        };

        st.message_length = st.message_length.saturating_add(length);
        if let Some(limit) = st.limit {
            if st.message_length > limit {
                return Err(self.protocol_violation(Error::MessageTooLarge));
            }
        }

        st.remaining = length;
        st.final_frame = fin;
        st.mask_key = mask_key;
        st.mask_pos = 0;

        if start {
            Ok(Advanced::Start(opcode, rsv1))
        } else {
            Ok(Advanced::Other)
        }
    }

    fn on_control(&self, st: &mut ReadState, opcode: OpCode, payload: &[u8]) -> Result<()> {
        match opcode {
            OpCode::Ping => {
                if let Some(handler) = st.handlers.ping.as_mut() {
                    handler(payload)
                } else {
                    let deadline = Instant::now() + PONG_WRITE_WAIT;
                    match self.write_control(OpCode::Pong, payload, Some(deadline)) {
                        Err(Error::CloseSent) => Ok(()),
                        Err(err) if err.is_timeout() => Ok(()),
                        other => other,
                    }
                }
            }
            OpCode::Pong => {
                if let Some(handler) = st.handlers.pong.as_mut() {
                    handler(payload)
                } else {
                    Ok(())
                }
            }
            OpCode::Close => {
                let (code, reason) = match close::parse_close_payload(payload) {
                    Ok(parsed) => parsed,
                    Err(err) => return Err(self.protocol_violation(err)),
                };
                let handled = st
                    .handlers
                    .close
                    .as_mut()
                    .map(|handler| handler(code, &reason));
                if let Some(result) = handled {
                    // a Close error from the handler propagates verbatim
                    if let Err(err) = result {
                        st.sticky = Some(ReadSticky::Broken);
                        return Err(err);
                    }
                } else {
                    let echo = if code == u16::from(CloseCode::NoStatus) {
                        Vec::new()
                    } else {
                        close::format_close_message(CloseCode::from(code), "")
                    };
                    let deadline = Instant::now() + WRITE_WAIT;
                    match self.write_control(OpCode::Close, &echo, Some(deadline)) {
                        Ok(()) | Err(Error::CloseSent) => {}
                        Err(err) if err.is_timeout() => {}
                        Err(err) => {
                            st.sticky = Some(ReadSticky::Broken);
                            return Err(err);
                        }
                    }
                }
                st.sticky = Some(ReadSticky::Close {
                    code,
                    reason: reason.clone(),
                });
                Err(Error::Close { code, reason })
            }
            _ => unreachable!("data opcode on control path"),
        }
    }

    // Best-effort close frame for a protocol violation, then hand the error
    // back for surfacing.
    fn protocol_violation(&self, err: Error) -> Error {
        let code = match err {
            Error::MessageTooLarge => CloseCode::Size,
            Error::InvalidUtf8 => CloseCode::Invalid,
            _ => CloseCode::Protocol,
        };
        let payload = close::format_close_message(code, &err.to_string());
        let deadline = Instant::now() + WRITE_WAIT;
        let _ = self.write_control(OpCode::Close, &payload, Some(deadline));
        err
    }

    fn terminate_utf8(&self) {
        let mut st = lock(&self.read);
        if st.sticky.is_none() {
            st.sticky = Some(ReadSticky::Broken);
        }
        drop(st);
        let _ = self.protocol_violation(Error::InvalidUtf8);
    }

    // ================== write path ====================

    /// Opens a streaming writer for one message. The payload is buffered and
    /// flushed as frames; closing the writer emits the FIN frame. Only one
    /// writer may exist at a time.
    pub fn next_writer(&self, opcode: OpCode) -> Result<MessageWriter<'_, S>> {
        if !opcode.is_data() {
            return Err(Error::InvalidMessageOpCode);
        }
        if let Some(sticky) = *lock(&self.write_sticky) {
            return Err(sticky.to_error());
        }
        if self.writer_active.swap(true, Ordering::Acquire) {
            return Err(Error::ConcurrentWriter);
        }

        let compress = self.compression && self.write_compression.load(Ordering::Relaxed);
        let deflater =
            compress.then(|| Deflater::acquire(self.compression_level.load(Ordering::Relaxed)));

        Ok(MessageWriter {
            conn: self,
            buf: self.acquire_write_buf(),
            pos: MAX_HEADER_SIZE,
            opcode,
            compress,
            first: true,
            deflater,
            done: false,
        })
    }

    /// Writes a complete message.
    pub fn write_message(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut writer = self.next_writer(opcode)?;
        writer.write_inner(payload)?;
        writer.finish()
    }

    /// Writes a control frame, racing `deadline` for both the internal frame
    /// lock and the wire write. Safe to call while a data writer is live; the
    /// frame is serialized between data frames, never inside one.
    pub fn write_control(
        &self,
        opcode: OpCode,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        if !opcode.is_control() {
            return Err(Error::InvalidControlOpCode);
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFrameTooLarge);
        }

        let mask = (self.role == Role::Client).then(rand::random::<[u8; 4]>);
        let header = FrameHeader {
            fin: true,
            rsv1: false,
            opcode,
            mask,
            payload_len: payload.len() as u64,
        };
        let mut buf = [0u8; MAX_HEADER_SIZE + MAX_CONTROL_PAYLOAD];
        let head_len = header.format(&mut buf);
        buf[head_len..head_len + payload.len()].copy_from_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut buf[head_len..head_len + payload.len()], key, 0);
        }

        self.write_wire(
            &buf[..head_len + payload.len()],
            deadline,
            opcode == OpCode::Close,
        )
    }

    /// Writes a pre-encoded message, reusing its cached frame bytes.
    pub fn write_prepared(&self, message: &crate::PreparedMessage) -> Result<()> {
        let compress = self.compression
            && self.write_compression.load(Ordering::Relaxed)
            && message.opcode().is_data();
        let data = message.frame(crate::prepared::PrepareKey {
            server: self.role == Role::Server,
            compress,
            level: self.compression_level.load(Ordering::Relaxed),
        })?;
        self.write_wire(&data, None, message.opcode() == OpCode::Close)
    }

    /// Sends a close frame if none has been sent, then shuts the stream down.
    /// Safe to call from any thread; repeated calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let deadline = Instant::now() + WRITE_WAIT;
        match self.write_control(OpCode::Close, &[], Some(deadline)) {
            Ok(()) | Err(Error::CloseSent) => {}
            Err(err) if err.is_timeout() => {}
            Err(Error::ConnectionClosed) => {}
            Err(err) => {
                log::debug!("close frame not sent: {err}");
            }
        }
        if !self.shutdown_done.swap(true, Ordering::SeqCst) {
            match self.stream.shutdown() {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // One frame, one wire write, under the frame lock.
    fn write_wire(&self, frame: &[u8], deadline: Option<Instant>, is_close: bool) -> Result<()> {
        let _guard = self.wire.acquire(deadline)?;

        if let Some(sticky) = *lock(&self.write_sticky) {
            return Err(sticky.to_error());
        }

        let armed = self.arm_write_timeout(deadline);
        let result = armed.and_then(|()| self.stream.write_all(frame).map_err(Error::from));
        match result {
            Ok(()) => {
                if is_close {
                    let mut sticky = lock(&self.write_sticky);
                    if sticky.is_none() {
                        *sticky = Some(WriteSticky::CloseSent);
                    }
                }
                Ok(())
            }
            Err(err) => {
                let mut sticky = lock(&self.write_sticky);
                if sticky.is_none() {
                    *sticky = Some(WriteSticky::Broken);
                }
                Err(err)
            }
        }
    }

    fn acquire_write_buf(&self) -> Vec<u8> {
        let size = MAX_HEADER_SIZE + self.write_buffer_size;
        let mut buf = self
            .write_pool
            .as_ref()
            .and_then(|pool| pool.get())
            .unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        buf
    }

    fn release_write_buf(&self, mut buf: Vec<u8>) {
        if let Some(pool) = self.write_pool.as_ref() {
            buf.clear();
            pool.put(buf);
        }
    }
}

fn unexpected_eof() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed mid-frame",
    ))
}

// ================== MessageReader ====================

/// Streaming payload reader for one message, returned by
/// [`Conn::next_reader`]. Implements [`io::Read`]; end-of-stream marks the
/// end of the message. A reader superseded by another `next_reader` call
/// reads as empty.
pub struct MessageReader<'c, S: Stream> {
    conn: &'c Conn<S>,
    seq: u64,
    inflater: Option<Inflater>,
    utf8: Option<Utf8Validator>,
    done: bool,
}

impl<S: Stream> MessageReader<'_, S> {
    pub(crate) fn read_inner(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }

        let conn = self.conn;
        let seq = self.seq;
        if conn.reader_superseded(seq) {
            self.done = true;
            return Ok(0);
        }

        let chunk = match self.inflater.as_mut() {
            Some(inflater) => {
                let mut superseded = false;
                let result = inflater.read(
                    &mut |buf| match conn.read_chunk(seq, buf)? {
                        ChunkRead::Data(n) => Ok(n),
                        ChunkRead::End => Ok(0),
                        ChunkRead::Superseded => {
                            superseded = true;
                            Ok(0)
                        }
                    },
                    out,
                );
                if superseded {
                    // whatever the decoder made of the truncated stream is
                    // moot; the message belongs to a later reader now
                    ChunkRead::Superseded
                } else {
                    match result? {
                        0 => ChunkRead::End,
                        n => ChunkRead::Data(n),
                    }
                }
            }
            None => conn.read_chunk(seq, out)?,
        };

        match chunk {
            ChunkRead::Superseded => {
                self.done = true;
                Ok(0)
            }
            ChunkRead::Data(n) => {
                if let Some(validator) = self.utf8.as_mut() {
                    if !validator.push(&out[..n]) {
                        self.done = true;
                        self.conn.terminate_utf8();
                        return Err(Error::InvalidUtf8);
                    }
                }
                Ok(n)
            }
            ChunkRead::End => {
                self.done = true;
                if let Some(validator) = self.utf8.as_mut() {
                    if !validator.finish() {
                        self.conn.terminate_utf8();
                        return Err(Error::InvalidUtf8);
                    }
                }
                Ok(0)
            }
        }
    }
}

impl<S: Stream> io::Read for MessageReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(into_io_error)
    }
}

// ================== MessageWriter ====================

/// Streaming payload writer for one message, returned by
/// [`Conn::next_writer`]. Payload accumulates in the connection's write
/// buffer and is flushed as frames when it fills; [`MessageWriter::finish`]
/// emits the final frame. Dropping an unfinished writer finishes it
/// best-effort.
pub struct MessageWriter<'c, S: Stream> {
    conn: &'c Conn<S>,
    buf: Vec<u8>,
    pos: usize,
    opcode: OpCode,
    compress: bool,
    first: bool,
    deflater: Option<Deflater>,
    done: bool,
}

impl<S: Stream> MessageWriter<'_, S> {
    pub(crate) fn write_inner(&mut self, payload: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::ConnectionClosed);
        }
        match self.deflater.take() {
            Some(mut deflater) => {
                let result = deflater.write(payload, &mut |chunk| self.buffer_all(chunk));
                self.deflater = Some(deflater);
                result
            }
            None => self.buffer_all(payload),
        }
    }

    /// Emits the final frame (possibly empty) and releases the writer slot.
    pub fn finish(mut self) -> Result<()> {
        self.do_finish()
    }

    fn do_finish(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if let Some(deflater) = self.deflater.take() {
            deflater.finish(&mut |chunk| self.buffer_all(chunk))?;
        }
        self.flush_frame(true)
    }

    fn buffer_all(&mut self, mut payload: &[u8]) -> Result<()> {
        while !payload.is_empty() {
            let space = self.buf.len() - self.pos;
            if space == 0 {
                self.flush_frame(false)?;
                continue;
            }
            let n = space.min(payload.len());
            self.buf[self.pos..self.pos + n].copy_from_slice(&payload[..n]);
            self.pos += n;
            payload = &payload[n..];
        }
        Ok(())
    }

    fn flush_frame(&mut self, fin: bool) -> Result<()> {
        let payload_len = self.pos - MAX_HEADER_SIZE;
        let mask = (self.conn.role == Role::Client).then(rand::random::<[u8; 4]>);
        let header = FrameHeader {
            fin,
            rsv1: self.compress && self.first,
            opcode: if self.first {
                self.opcode
            } else {
                OpCode::Continuation
            },
            mask,
            payload_len: payload_len as u64,
        };

        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = header.format(&mut head);
        let start = MAX_HEADER_SIZE - head_len;
        self.buf[start..MAX_HEADER_SIZE].copy_from_slice(&head[..head_len]);
        if let Some(key) = mask {
            apply_mask(&mut self.buf[MAX_HEADER_SIZE..self.pos], key, 0);
        }

        let frame_end = self.pos;
        self.first = false;
        self.pos = MAX_HEADER_SIZE;
        self.conn.write_wire(&self.buf[start..frame_end], None, false)
    }
}

impl<S: Stream> io::Write for MessageWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Stream> Drop for MessageWriter<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.do_finish();
        }
        let buf = std::mem::take(&mut self.buf);
        self.conn.release_write_buf(buf);
        self.conn.writer_active.store(false, Ordering::Release);
    }
}

fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        other => io::Error::other(other),
    }
}

// ================== streaming UTF-8 validation ====================

// Validates text payloads incrementally so an invalid byte is caught on the
// chunk that carries it, with at most one partial character buffered across
// chunk (and fragment) boundaries.
#[derive(Default)]
struct Utf8Validator {
    partial: [u8; 4],
    partial_len: usize,
}

fn utf8_char_len(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

impl Utf8Validator {
    fn push(&mut self, mut chunk: &[u8]) -> bool {
        if self.partial_len > 0 {
            let need = utf8_char_len(self.partial[0]);
            while self.partial_len < need && !chunk.is_empty() {
                self.partial[self.partial_len] = chunk[0];
                self.partial_len += 1;
                chunk = &chunk[1..];
            }
            if self.partial_len < need {
                return true;
            }
            if std::str::from_utf8(&self.partial[..need]).is_err() {
                return false;
            }
            self.partial_len = 0;
        }

        match std::str::from_utf8(chunk) {
            Ok(_) => true,
            Err(err) => {
                if err.error_len().is_some() {
                    return false;
                }
                let tail = &chunk[err.valid_up_to()..];
                if utf8_char_len(tail[0]) < 2 {
                    return false;
                }
                self.partial[..tail.len()].copy_from_slice(tail);
                self.partial_len = tail.len();
                true
            }
        }
    }

    fn finish(&mut self) -> bool {
        self.partial_len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::pipe;
    use std::sync::atomic::AtomicUsize;

    fn conn_config(role: Role, compression: bool) -> ConnConfig {
        ConnConfig {
            role,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            write_pool: None,
            subprotocol: None,
            compression,
            buffered: Vec::new(),
        }
    }

    fn conn_pair(compression: bool) -> (Conn<crate::testutil::Pipe>, Conn<crate::testutil::Pipe>) {
        let (a, b) = pipe();
        let client = Conn::new(a, conn_config(Role::Client, compression));
        let server = Conn::new(b, conn_config(Role::Server, compression));
        (client, server)
    }

    #[test]
    fn test_echo_text_message() {
        let (client, server) = conn_pair(false);

        client.write_message(OpCode::Text, b"Hello, WebSocket!").unwrap();
        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, b"Hello, WebSocket!");

        server.write_message(OpCode::Binary, &[1, 2, 3]).unwrap();
        let (opcode, payload) = client.read_message().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(payload, [1, 2, 3]);
    }

    #[test]
    fn test_client_frames_are_masked() {
        let (client, server) = conn_pair(false);

        client.write_message(OpCode::Binary, b"masked").unwrap();
        // inspect the raw frame the server side would read
        let raw = server.get_ref().peek_incoming();
        assert_eq!(raw[0], 0x82);
        assert_eq!(raw[1], 0x80 | 6); // MASK bit + length
        let key = [raw[2], raw[3], raw[4], raw[5]];
        let mut body = raw[6..12].to_vec();
        apply_mask(&mut body, key, 0);
        assert_eq!(body, b"masked");

        let (_, payload) = server.read_message().unwrap();
        assert_eq!(payload, b"masked");
    }

    #[test]
    fn test_server_frames_are_unmasked() {
        let (client, server) = conn_pair(false);
        server.write_message(OpCode::Binary, b"plain").unwrap();
        let raw = client.get_ref().peek_incoming();
        assert_eq!(raw[0], 0x82);
        assert_eq!(raw[1], 5); // no MASK bit
        assert_eq!(&raw[2..7], b"plain");
        client.read_message().unwrap();
    }

    #[test]
    fn test_streaming_writer_fragments() {
        let (a, b) = pipe();
        let client = Conn::new(
            a,
            ConnConfig {
                write_buffer_size: MIN_BUFFER_SIZE,
                ..conn_config(Role::Client, false)
            },
        );
        let server = Conn::new(b, conn_config(Role::Server, false));

        let payload: Vec<u8> = (0..(MIN_BUFFER_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        client.write_message(OpCode::Binary, &payload).unwrap();

        let (opcode, echoed) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_fragmented_message_with_ping_interleave() {
        let (_client, server) = conn_pair(false);

        let pings = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&pings);
        server.set_ping_handler(Some(Box::new(move |payload: &[u8]| {
            lock(&seen).push(payload.to_vec());
            Ok(())
        })));

        // craft client frames by hand with a zero mask key
        let wire = server.get_ref();
        wire.inject_incoming(&[0x02, 0x83, 0, 0, 0, 0, b'H', b'e', b'l']); // binary, FIN=0
        wire.inject_incoming(&[0x89, 0x89, 0, 0, 0, 0]); // ping, FIN=1
        wire.inject_incoming(b"ping-data");
        wire.inject_incoming(&[0x80, 0x82, 0, 0, 0, 0, b'l', b'o']); // continuation, FIN=1

        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(payload, b"Hello");
        assert_eq!(lock(&pings).as_slice(), &[b"ping-data".to_vec()]);
    }

    #[test]
    fn test_default_ping_handler_answers_pong() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        wire.inject_incoming(&[0x89, 0x84, 0, 0, 0, 0, b'e', b'c', b'h', b'o']); // ping
        wire.inject_incoming(&[0x82, 0x80, 0, 0, 0, 0]); // empty binary so the read returns

        let (_, payload) = server.read_message().unwrap();
        assert!(payload.is_empty());

        let out = wire.peek_outgoing();
        assert_eq!(out[0], 0x8A); // pong, FIN
        assert_eq!(out[1], 4);
        assert_eq!(&out[2..6], b"echo");
    }

    #[test]
    fn test_close_handshake() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        // close frame, code 1000, reason "bye"
        wire.inject_incoming(&[0x88, 0x85, 0, 0, 0, 0, 0x03, 0xE8, b'b', b'y', b'e']);

        let err = server.read_message().unwrap_err();
        assert_eq!(err.close_frame(), Some((1000, "bye")));

        // a close frame with the same code and empty reason went out
        let out = wire.peek_outgoing();
        assert_eq!(out[0], 0x88);
        assert_eq!(out[1], 2);
        assert_eq!(&out[2..4], &[0x03, 0xE8]);

        // writes after close-sent fail
        assert!(matches!(
            server.write_message(OpCode::Text, b"x"),
            Err(Error::CloseSent)
        ));
        // reads keep returning the close error
        let err = server.read_message().unwrap_err();
        assert_eq!(err.close_frame(), Some((1000, "bye")));
    }

    #[test]
    fn test_close_error_propagates_from_custom_handler() {
        let (_client, server) = conn_pair(false);
        server.set_close_handler(Some(Box::new(|code, reason| {
            Err(Error::Close {
                code,
                reason: format!("handler saw {reason}"),
            })
        })));
        let wire = server.get_ref();
        wire.inject_incoming(&[0x88, 0x85, 0, 0, 0, 0, 0x03, 0xE8, b'b', b'y', b'e']);

        let err = server.read_message().unwrap_err();
        assert_eq!(err.close_frame(), Some((1000, "handler saw bye")));
    }

    #[test]
    fn test_read_limit() {
        let (_client, server) = conn_pair(false);
        server.set_read_limit(Some(4));
        let wire = server.get_ref();
        wire.inject_incoming(&[0x82, 0x85, 0, 0, 0, 0, 1, 2, 3, 4, 5]);

        assert!(matches!(
            server.read_message(),
            Err(Error::MessageTooLarge)
        ));

        // a 1009 close frame went out
        let out = wire.peek_outgoing();
        assert_eq!(out[0], 0x88);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 1009);
    }

    #[test]
    fn test_invalid_utf8_closes_with_1007() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        wire.inject_incoming(&[0x81, 0x83, 0, 0, 0, 0, 0xFF, 0xFE, 0xFD]);

        assert!(matches!(server.read_message(), Err(Error::InvalidUtf8)));

        let out = wire.peek_outgoing();
        assert_eq!(out[0], 0x88);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 1007);
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        // "é" = 0xC3 0xA9 split across two fragments
        wire.inject_incoming(&[0x01, 0x82, 0, 0, 0, 0, b'a', 0xC3]);
        wire.inject_incoming(&[0x80, 0x82, 0, 0, 0, 0, 0xA9, b'b']);

        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, "aéb".as_bytes());
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        wire.inject_incoming(&[0x82, 0x01, b'x']); // no MASK bit toward server

        assert!(matches!(server.read_message(), Err(Error::BadMask)));
        let out = wire.peek_outgoing();
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 1002);
    }

    #[test]
    fn test_control_frame_discipline() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        wire.inject_incoming(&[0x09, 0x80, 0, 0, 0, 0]); // ping with FIN=0
        assert!(matches!(
            server.read_message(),
            Err(Error::ControlFrameFragmented)
        ));

        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        // ping with 126-byte payload advertised via extended length
        let mut frame = vec![0x89, 0x80 | 126, 0x00, 126, 0, 0, 0, 0];
        frame.extend(std::iter::repeat(0u8).take(126));
        wire.inject_incoming(&frame);
        assert!(matches!(
            server.read_message(),
            Err(Error::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_concurrent_writer_rejected() {
        let (client, _server) = conn_pair(false);
        let writer = client.next_writer(OpCode::Text).unwrap();
        assert!(matches!(
            client.next_writer(OpCode::Text),
            Err(Error::ConcurrentWriter)
        ));
        writer.finish().unwrap();
        // slot released
        client.next_writer(OpCode::Binary).unwrap().finish().unwrap();
    }

    #[test]
    fn test_write_control_interleaves_with_writer() {
        let (client, server) = conn_pair(false);
        let mut writer = client.next_writer(OpCode::Text).unwrap();
        writer.write_inner(b"part one ").unwrap();
        client
            .write_control(OpCode::Ping, b"mid", Some(Instant::now() + WRITE_WAIT))
            .unwrap();
        writer.write_inner(b"part two").unwrap();
        writer.finish().unwrap();

        // server sees the ping first (buffered data had not flushed yet)
        let pings = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&pings);
        server.set_ping_handler(Some(Box::new(move |p: &[u8]| {
            lock(&seen).push(p.to_vec());
            Ok(())
        })));
        let (_, payload) = server.read_message().unwrap();
        assert_eq!(payload, b"part one part two");
        assert_eq!(lock(&pings).len(), 1);
    }

    #[test]
    fn test_next_reader_discards_unread_message() {
        let (client, server) = conn_pair(false);
        client.write_message(OpCode::Binary, &[1u8; 64]).unwrap();
        client.write_message(OpCode::Text, b"second").unwrap();

        let (opcode, mut reader) = server.next_reader().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        let mut partial = [0u8; 8];
        reader.read_inner(&mut partial).unwrap();
        drop(reader);

        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, b"second");
    }

    #[test]
    fn test_superseded_text_reader_reads_empty_without_poisoning() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        // text message whose first fragment ends mid multi-byte character
        wire.inject_incoming(&[0x01, 0x82, 0, 0, 0, 0, b'a', 0xC3]);
        wire.inject_incoming(&[0x80, 0x82, 0, 0, 0, 0, 0xA9, b'b']);
        // a second, complete text message
        wire.inject_incoming(&[0x81, 0x82, 0, 0, 0, 0, b'o', b'k']);

        let (_, mut stale) = server.next_reader().unwrap();
        let mut buf = [0u8; 2];
        // consumes "a" plus the dangling 0xC3, leaving a buffered partial char
        assert_eq!(stale.read_inner(&mut buf).unwrap(), 2);

        // abandon the first message; the stale reader must now read as empty
        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, b"ok");

        assert_eq!(stale.read_inner(&mut buf).unwrap(), 0);
        assert_eq!(stale.read_inner(&mut buf).unwrap(), 0);

        // no bogus close(1007) went out and the connection still works
        assert!(wire.peek_outgoing().is_empty());
        wire.inject_incoming(&[0x81, 0x83, 0, 0, 0, 0, b'y', b'e', b's']);
        let (_, payload) = server.read_message().unwrap();
        assert_eq!(payload, b"yes");
    }

    #[test]
    fn test_compressed_round_trip() {
        let (client, server) = conn_pair(true);
        let message: Vec<u8> = (0..8192u32).map(|i| (i % 17) as u8).collect();

        client.write_message(OpCode::Binary, &message).unwrap();
        // RSV1 must be set on the wire
        let raw = server.get_ref().peek_incoming();
        assert_eq!(raw[0] & 0x40, 0x40);

        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(payload, message);

        server.write_message(OpCode::Text, b"compressed reply").unwrap();
        let (_, payload) = client.read_message().unwrap();
        assert_eq!(payload, b"compressed reply");
    }

    #[test]
    fn test_compression_toggle_per_message() {
        let (client, server) = conn_pair(true);
        client.enable_write_compression(false);
        client.write_message(OpCode::Text, b"stored").unwrap();
        let raw = server.get_ref().peek_incoming();
        assert_eq!(raw[0] & 0x40, 0); // RSV1 clear
        let (_, payload) = server.read_message().unwrap();
        assert_eq!(payload, b"stored");
    }

    #[test]
    fn test_rsv1_without_negotiation_rejected() {
        let (_client, server) = conn_pair(false);
        let wire = server.get_ref();
        wire.inject_incoming(&[0xC2, 0x81, 0, 0, 0, 0, 0x00]); // RSV1 set

        assert!(matches!(
            server.read_message(),
            Err(Error::CompressionNotNegotiated)
        ));
    }

    #[test]
    fn test_read_deadline() {
        let (_client, server) = conn_pair(false);
        server.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));
        let err = server.read_message().unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err:?}");

        // the read side is broken afterwards
        assert!(matches!(
            server.read_message(),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (client, _server) = conn_pair(false);
        client.close().unwrap();
        client.close().unwrap();
        assert!(matches!(
            client.write_message(OpCode::Text, b"x"),
            Err(Error::CloseSent)
        ));
    }

    #[test]
    fn test_write_buffer_pool_reuse() {
        struct CountingPool {
            buffers: Mutex<Vec<Vec<u8>>>,
            gets: AtomicUsize,
            puts: AtomicUsize,
        }
        impl BufferPool for CountingPool {
            fn get(&self) -> Option<Vec<u8>> {
                self.gets.fetch_add(1, Ordering::Relaxed);
                lock(&self.buffers).pop()
            }
            fn put(&self, buf: Vec<u8>) {
                assert!(buf.is_empty(), "buffer returned uncleared");
                self.puts.fetch_add(1, Ordering::Relaxed);
                lock(&self.buffers).push(buf);
            }
        }

        let pool = Arc::new(CountingPool {
            buffers: Mutex::new(Vec::new()),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        });

        let (a, b) = pipe();
        let client = Conn::new(
            a,
            ConnConfig {
                write_pool: Some(pool.clone()),
                ..conn_config(Role::Client, false)
            },
        );
        let server = Conn::new(b, conn_config(Role::Server, false));

        client.write_message(OpCode::Text, b"one").unwrap();
        client.write_message(OpCode::Text, b"two").unwrap();
        assert_eq!(pool.gets.load(Ordering::Relaxed), 2);
        assert_eq!(pool.puts.load(Ordering::Relaxed), 2);

        server.read_message().unwrap();
        let (_, payload) = server.read_message().unwrap();
        assert_eq!(payload, b"two");
    }

    #[test]
    fn test_prepared_message_fan_out() {
        let message = crate::PreparedMessage::new(OpCode::Text, b"broadcast").unwrap();

        let (client, server) = conn_pair(false);
        client.write_prepared(&message).unwrap();
        let (opcode, payload) = server.read_message().unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, b"broadcast");

        let (client2, server2) = conn_pair(false);
        client2.write_prepared(&message).unwrap();
        let (_, payload) = server2.read_message().unwrap();
        assert_eq!(payload, b"broadcast");
    }
}
