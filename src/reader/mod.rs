//! Per-connection incoming-frame reading.
//!
//! [`RequestReader`] stitches one length-prefixed frame out of arbitrary TCP
//! segment boundaries. Whenever the prefix is still incomplete it issues a
//! scatter read into the connection's header and body working buffers, so a
//! single syscall can split its bytes across both; once the prefix is known
//! the body buffer alone is filled. Bytes read past the end of the current
//! frame are returned as a [`Remainder`] and re-entered through
//! [`RequestReader::read_preloaded`] without touching the socket.

use std::{
    io::{self, IoSliceMut, Read},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    factory::{CodecError, Message, MessageFactory},
    framing::LengthFormat,
};

mod body;
mod header;

pub use body::BodyReader;
pub use header::HeaderReader;

/// Errors that terminate a connection from the read path.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The length prefix declares a body larger than the configured maximum.
    #[error("frame declares a {size}-byte body, exceeding the {max}-byte maximum")]
    OversizedFrame {
        /// Declared body length.
        size: u64,
        /// Configured maximum body length.
        max: usize,
    },
    /// The codec rejected a completed frame body.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Fixed-capacity working buffer a connection reads into.
///
/// Tracks how much of the buffer is filled; scatter reads land in the
/// unfilled tail so partially-read prefixes are never overwritten.
#[derive(Debug)]
pub struct FrameBuf {
    data: Box<[u8]>,
    filled: usize,
}

impl FrameBuf {
    /// Allocate a buffer of `capacity` bytes, sized once per connection.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    /// The filled prefix of the buffer.
    #[must_use]
    pub fn filled(&self) -> &[u8] { &self.data[..self.filled] }

    /// Number of filled bytes.
    #[must_use]
    pub fn filled_len(&self) -> usize { self.filled }

    /// Remaining capacity.
    #[must_use]
    pub fn space(&self) -> usize { self.data.len() - self.filled }

    /// The unfilled tail, for reads to land in.
    pub fn unfilled_mut(&mut self) -> &mut [u8] { &mut self.data[self.filled..] }

    /// Record that `n` bytes of the unfilled tail were written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.space(), "advance past buffer capacity");
        self.filled += n;
    }

    /// Copy `bytes` into the buffer as already-read content.
    pub fn preload(&mut self, bytes: &[u8]) {
        self.data[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
    }

    /// Forget the filled content ahead of the next frame.
    pub fn reset(&mut self) { self.filled = 0; }
}

/// Surplus bytes read past the end of a completed frame.
///
/// The surplus is the prefix of the next frame: up to one length prefix
/// worth of bytes in `header`, anything further in `body`. The caller
/// preloads these into fresh working buffers and re-enters decoding via
/// [`RequestReader::read_preloaded`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Remainder {
    /// Bytes belonging to the next frame's length prefix.
    pub header: Vec<u8>,
    /// Bytes belonging to the next frame's body.
    pub body: Vec<u8>,
}

impl Remainder {
    fn split(surplus: &[u8], header_size: usize) -> Self {
        let cut = surplus.len().min(header_size);
        Self {
            header: surplus[..cut].to_vec(),
            body: surplus[cut..].to_vec(),
        }
    }

    /// Whether any surplus bytes were carried over.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.header.is_empty() && self.body.is_empty() }
}

enum Fill {
    Bytes(usize),
    EndOfStream,
}

/// Reads and decodes one frame from a stream socket.
///
/// The reader is reset between frames; the connection's working buffers and
/// the codec are reused for the connection's whole lifetime.
pub struct RequestReader<F: MessageFactory> {
    label: Arc<str>,
    header_size: usize,
    header: HeaderReader,
    body: BodyReader<F>,
    end_of_stream: bool,
}

impl<F: MessageFactory> RequestReader<F> {
    /// Create a reader for one connection.
    ///
    /// `label` names the connection in log output only.
    #[must_use]
    pub fn new(
        label: Arc<str>,
        factory: Arc<F>,
        format: LengthFormat,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            label,
            header_size: format.width(),
            header: HeaderReader::new(format, max_body_bytes),
            body: BodyReader::new(factory),
            end_of_stream: false,
        }
    }

    /// Drain the socket's readable bytes and decode as much of the current
    /// frame as they cover.
    ///
    /// Reads repeatedly until the socket would block or both working buffers
    /// are full. End-of-stream and I/O errors mark the reader terminal and
    /// yield an empty remainder; bytes read in the same cycle are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::OversizedFrame`] for an impossible length prefix
    /// and [`ReadError::Codec`] when a completed body fails to decode. Both
    /// terminate the connection.
    pub fn read(
        &mut self,
        chan: &mut impl Read,
        header_buf: &mut FrameBuf,
        body_buf: &mut FrameBuf,
    ) -> Result<Remainder, ReadError> {
        debug_assert!(!self.end_of_stream, "read on a reader past end of stream");
        match self.fill_from(chan, header_buf, body_buf) {
            Fill::EndOfStream => {
                log::debug!("[{}] end of stream", self.label);
                self.end_of_stream = true;
                Ok(Remainder::default())
            }
            Fill::Bytes(0) => Ok(Remainder::default()),
            Fill::Bytes(n) => {
                log::trace!("[{}] read {n} bytes from socket", self.label);
                self.decode(header_buf, body_buf)
            }
        }
    }

    /// Decode bytes already sitting in the working buffers, skipping the
    /// socket read.
    ///
    /// This drains carry-over from a previous frame; see [`Remainder`].
    ///
    /// # Errors
    ///
    /// As for [`Self::read`].
    pub fn read_preloaded(
        &mut self,
        header_buf: &mut FrameBuf,
        body_buf: &mut FrameBuf,
    ) -> Result<Remainder, ReadError> {
        let total = header_buf.filled_len() + body_buf.filled_len();
        if total == 0 {
            return Ok(Remainder::default());
        }
        log::trace!("[{}] decoding {total} preloaded bytes", self.label);
        self.decode(header_buf, body_buf)
    }

    /// Whether a complete message is waiting to be taken.
    #[must_use]
    pub fn message_complete(&self) -> bool { self.body.is_complete() }

    /// Take the decoded message, if the current frame completed.
    pub fn take_message(&mut self) -> Option<Message<F::Output>> { self.body.take_message() }

    /// Whether the peer closed the stream. Terminal once set.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool { self.end_of_stream }

    /// Reset frame-decoding state ahead of the next frame. End-of-stream is
    /// terminal and survives resets.
    pub fn reset(&mut self) {
        self.header.reset();
        self.body.reset();
    }

    fn fill_from(
        &mut self,
        chan: &mut impl Read,
        header_buf: &mut FrameBuf,
        body_buf: &mut FrameBuf,
    ) -> Fill {
        let mut total = 0usize;
        loop {
            let scatter = !self.header.is_complete();
            let header_space = if scatter { header_buf.space() } else { 0 };
            if header_space + body_buf.space() == 0 {
                break;
            }
            let read = if scatter {
                let mut bufs = [
                    IoSliceMut::new(header_buf.unfilled_mut()),
                    IoSliceMut::new(body_buf.unfilled_mut()),
                ];
                chan.read_vectored(&mut bufs)
            } else {
                chan.read(body_buf.unfilled_mut())
            };
            match read {
                Ok(0) => return Fill::EndOfStream,
                Ok(n) => {
                    let into_header = n.min(header_space);
                    header_buf.advance(into_header);
                    body_buf.advance(n - into_header);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("[{}] socket error in read, ending stream: {e}", self.label);
                    return Fill::EndOfStream;
                }
            }
        }
        Fill::Bytes(total)
    }

    fn decode(
        &mut self,
        header_buf: &FrameBuf,
        body_buf: &FrameBuf,
    ) -> Result<Remainder, ReadError> {
        let mut prefix_just_completed = false;
        if !self.header.is_complete() {
            let fresh = &header_buf.filled()[self.header.received()..];
            if fresh.is_empty() {
                return Ok(Remainder::default());
            }
            self.header.feed(fresh);
            if !self.header.is_complete() {
                return Ok(Remainder::default());
            }
            prefix_just_completed = true;
        }
        let declared = self.header.body_len()?;
        if prefix_just_completed {
            log::trace!("[{}] length prefix complete, body is {declared} bytes", self.label);
        }
        self.body.set_size(declared)?;
        let fresh = &body_buf.filled()[self.body.received()..];
        if !fresh.is_empty() {
            self.body.feed(fresh)?;
        }
        if self.body.is_complete() && body_buf.filled_len() > declared {
            return Ok(Remainder::split(
                &body_buf.filled()[declared..],
                self.header_size,
            ));
        }
        Ok(Remainder::default())
    }
}
