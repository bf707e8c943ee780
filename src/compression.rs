//! permessage-deflate support (RFC 7692), no-context-takeover mode.
//!
//! The writer side runs payload bytes through a raw DEFLATE encoder whose
//! output is filtered by a trailing-four-byte strip: a sync flush always ends
//! with the empty stored block `00 00 FF FF`, which the receiver can
//! reconstruct, so it is held back and verified instead of being sent. The
//! reader side appends that block plus a final-block marker so the decoder
//! terminates cleanly.
//!
//! Encoders are pooled per compression level and decoders in a single pool;
//! both are reset before reuse.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

use crate::{Error, Result};

pub(crate) const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

pub(crate) const MIN_COMPRESSION_LEVEL: i32 = -2;
pub(crate) const MAX_COMPRESSION_LEVEL: i32 = 9;
pub(crate) const DEFAULT_COMPRESSION_LEVEL: i32 = 1;

/// Sync-flush trailer of a deflate stream, stripped on write and re-appended
/// on read, followed by a final empty block so the decoder sees stream end.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const INFLATE_TAIL: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

const CHUNK: usize = 4096;

/// Byte sink fed by the compression pipeline.
pub(crate) type Sink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<()>;

pub(crate) fn is_valid_compression_level(level: i32) -> bool {
    (MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level)
}

fn flate_compression(level: i32) -> flate2::Compression {
    match level {
        i32::MIN..=-2 => flate2::Compression::fast(),
        -1 => flate2::Compression::default(),
        0..=9 => flate2::Compression::new(level as u32),
        _ => flate2::Compression::best(),
    }
}

fn deflater_pools() -> &'static [Mutex<Vec<Compress>>; 12] {
    static POOLS: OnceLock<[Mutex<Vec<Compress>>; 12]> = OnceLock::new();
    POOLS.get_or_init(|| std::array::from_fn(|_| Mutex::new(Vec::new())))
}

fn inflater_pool() -> &'static Mutex<Vec<Decompress>> {
    static POOL: OnceLock<Mutex<Vec<Decompress>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

// ================== Deflater ====================

/// Streaming message compressor with the trailer-strip filter.
///
/// Output produced by the encoder passes through a four-byte hold-back
/// buffer, so whatever the sink receives is the compressed message minus its
/// sync-flush trailer. [`Deflater::finish`] verifies that the held-back bytes
/// are exactly `00 00 FF FF` before returning the encoder to its pool.
pub(crate) struct Deflater {
    level: i32,
    compress: Option<Compress>,
    tail: [u8; 4],
    tail_len: usize,
}

impl Deflater {
    /// Takes a pooled encoder for `level`, or creates one.
    pub(crate) fn acquire(level: i32) -> Self {
        let pool = &deflater_pools()[(level - MIN_COMPRESSION_LEVEL) as usize];
        let compress = pool
            .lock()
            .expect("deflater pool poisoned")
            .pop()
            .unwrap_or_else(|| Compress::new(flate_compression(level), false));
        Self {
            level,
            compress: Some(compress),
            tail: [0; 4],
            tail_len: 0,
        }
    }

    /// Compresses `input` into the sink.
    pub(crate) fn write(&mut self, mut input: &[u8], out: Sink<'_>) -> Result<()> {
        let mut tmp = [0u8; CHUNK];
        while !input.is_empty() {
            let compress = self.compress.as_mut().ok_or(Error::ConnectionClosed)?;
            let before_in = compress.total_in();
            let before_out = compress.total_out();
            let status = compress
                .compress(input, &mut tmp, FlushCompress::None)
                .map_err(|_| Error::CorruptDeflateStream)?;
            let consumed = (compress.total_in() - before_in) as usize;
            let produced = (compress.total_out() - before_out) as usize;

            if let Status::StreamEnd = status {
                return Err(Error::CorruptDeflateStream);
            }
            self.forward(&tmp[..produced], out)?;
            input = &input[consumed..];
            if consumed == 0 && produced == 0 {
                return Err(Error::CorruptDeflateStream);
            }
        }
        Ok(())
    }

    /// Flushes the encoder, verifies and strips the trailer, and returns the
    /// encoder to its pool.
    pub(crate) fn finish(mut self, out: Sink<'_>) -> Result<()> {
        let mut tmp = [0u8; CHUNK];
        let mut flush = FlushCompress::Sync;
        loop {
            let compress = self.compress.as_mut().ok_or(Error::ConnectionClosed)?;
            let before_out = compress.total_out();
            compress
                .compress(&[], &mut tmp, flush)
                .map_err(|_| Error::CorruptDeflateStream)?;
            let produced = (compress.total_out() - before_out) as usize;
            if produced == 0 && matches!(flush, FlushCompress::None) {
                break;
            }
            self.forward(&tmp[..produced], out)?;
            flush = FlushCompress::None;
        }

        if self.tail_len != 4 || self.tail != DEFLATE_TRAILER {
            return Err(Error::CorruptDeflateStream);
        }

        let mut compress = self.compress.take().expect("live deflater");
        compress.reset();
        deflater_pools()[(self.level - MIN_COMPRESSION_LEVEL) as usize]
            .lock()
            .expect("deflater pool poisoned")
            .push(compress);
        Ok(())
    }

    // Pass `p` through the four-byte hold-back buffer into the sink.
    fn forward(&mut self, mut p: &[u8], out: Sink<'_>) -> Result<()> {
        if self.tail_len < 4 {
            let n = (4 - self.tail_len).min(p.len());
            self.tail[self.tail_len..self.tail_len + n].copy_from_slice(&p[..n]);
            self.tail_len += n;
            p = &p[n..];
            if p.is_empty() {
                return Ok(());
            }
        }

        let m = p.len().min(4);
        out(&self.tail[..m])?;
        self.tail.copy_within(m.., 0);
        self.tail[4 - m..].copy_from_slice(&p[p.len() - m..]);
        out(&p[..p.len() - m])
    }
}

// ================== Inflater ====================

/// Streaming message decompressor.
///
/// Raw message bytes are pulled from a `fill` callback; once it reports
/// end-of-message the reconstructed trailer and a final-block marker are fed
/// to the decoder, which then reports stream end. The decoder returns to its
/// pool on end-of-stream or drop.
pub(crate) struct Inflater {
    decompress: Option<Decompress>,
    buf: Box<[u8; CHUNK]>,
    buf_pos: usize,
    buf_len: usize,
    source_eof: bool,
    tail_pos: usize,
    done: bool,
}

impl Inflater {
    /// Takes a pooled decoder, or creates one.
    pub(crate) fn acquire() -> Self {
        let decompress = inflater_pool()
            .lock()
            .expect("inflater pool poisoned")
            .pop()
            .unwrap_or_else(|| Decompress::new(false));
        Self {
            decompress: Some(decompress),
            buf: Box::new([0; CHUNK]),
            buf_pos: 0,
            buf_len: 0,
            source_eof: false,
            tail_pos: 0,
            done: false,
        }
    }

    /// Decompresses into `out`, pulling compressed bytes from `fill`.
    /// Returns `Ok(0)` at end of message.
    pub(crate) fn read(
        &mut self,
        fill: &mut dyn FnMut(&mut [u8]) -> Result<usize>,
        out: &mut [u8],
    ) -> Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }

        loop {
            if self.buf_pos == self.buf_len && !self.source_eof {
                let n = fill(&mut self.buf[..])?;
                self.buf_pos = 0;
                self.buf_len = n;
                if n == 0 {
                    self.source_eof = true;
                }
                continue;
            }

            let from_tail = self.buf_pos == self.buf_len;
            let input: &[u8] = if from_tail {
                &INFLATE_TAIL[self.tail_pos..]
            } else {
                &self.buf[self.buf_pos..self.buf_len]
            };

            let decompress = self.decompress.as_mut().ok_or(Error::ConnectionClosed)?;
            let before_in = decompress.total_in();
            let before_out = decompress.total_out();
            let status = decompress
                .decompress(input, out, FlushDecompress::None)
                .map_err(|_| Error::CorruptDeflateStream)?;
            let consumed = (decompress.total_in() - before_in) as usize;
            let produced = (decompress.total_out() - before_out) as usize;

            if from_tail {
                self.tail_pos += consumed;
            } else {
                self.buf_pos += consumed;
            }

            if produced > 0 {
                if let Status::StreamEnd = status {
                    self.release();
                }
                return Ok(produced);
            }

            match status {
                Status::StreamEnd => {
                    self.release();
                    return Ok(0);
                }
                _ if from_tail && self.tail_pos == INFLATE_TAIL.len() => {
                    self.release();
                    return Ok(0);
                }
                _ if consumed == 0 => {
                    return Err(Error::CorruptDeflateStream);
                }
                _ => {}
            }
        }
    }

    fn release(&mut self) {
        self.done = true;
        if let Some(mut decompress) = self.decompress.take() {
            decompress.reset(false);
            inflater_pool()
                .lock()
                .expect("inflater pool poisoned")
                .push(decompress);
        }
    }
}

impl Drop for Inflater {
    fn drop(&mut self) {
        self.release();
    }
}

// ================== Negotiation ====================

/// Negotiated permessage-deflate parameters.
///
/// Only the context-takeover flags are modeled; `*_max_window_bits` offers
/// are parsed and ignored since every message is compressed with a fresh
/// window anyway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DeflateExt {
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

impl DeflateExt {
    /// The only mode this implementation offers or accepts.
    pub(crate) fn no_context_takeover() -> Self {
        Self {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
        }
    }

    fn parse(input: &str) -> std::result::Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (mut remaining, _) = tag(PERMESSAGE_DEFLATE)(input)?;
        while !remaining.is_empty() {
            let (rest, (key, _value)) = Self::parse_param(remaining)?;
            match key {
                "server_no_context_takeover" => this.server_no_context_takeover = true,
                "client_no_context_takeover" => this.client_no_context_takeover = true,
                _ => {}
            }
            remaining = rest;
        }
        Ok(this)
    }

    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        // e.g. "; server_no_context_takeover" or "; server_max_window_bits=12"
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }

    /// Builds the negotiated settings from the parsed extension offers,
    /// returning `None` when no `permessage-deflate` offer is present.
    pub(crate) fn from_offers(offers: &[HashMap<String, String>]) -> Option<Self> {
        offers
            .iter()
            .find(|ext| ext.get("").map(String::as_str) == Some(PERMESSAGE_DEFLATE))
            .map(|_| Self::no_context_takeover())
    }
}

impl std::fmt::Display for DeflateExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DeflateExt {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(input).map_err(|err| err.to_string())
    }
}
