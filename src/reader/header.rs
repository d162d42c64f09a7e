//! Length-prefix accumulation across partial reads.

use crate::framing::LengthFormat;

use super::ReadError;

/// Accumulates the fixed-size length prefix of one frame.
///
/// The prefix may arrive split across any number of socket reads; `feed`
/// consumes at most the bytes still missing, so trailing input is left for
/// the caller.
#[derive(Debug)]
pub struct HeaderReader {
    format: LengthFormat,
    max_body_bytes: usize,
    buf: [u8; 8],
    filled: usize,
}

impl HeaderReader {
    /// Create a reader for prefixes in `format`, bounding the declared body
    /// length by `max_body_bytes`.
    #[must_use]
    pub fn new(format: LengthFormat, max_body_bytes: usize) -> Self {
        Self {
            format,
            max_body_bytes,
            buf: [0u8; 8],
            filled: 0,
        }
    }

    /// Consume prefix bytes from `input`, returning how many were taken.
    pub fn feed(&mut self, input: &[u8]) -> usize {
        let take = self.remaining().min(input.len());
        self.buf[self.filled..self.filled + take].copy_from_slice(&input[..take]);
        self.filled += take;
        take
    }

    /// Number of prefix bytes still missing.
    #[must_use]
    pub fn remaining(&self) -> usize { self.format.width() - self.filled }

    /// Number of prefix bytes accumulated so far.
    #[must_use]
    pub fn received(&self) -> usize { self.filled }

    /// Whether the full prefix has been accumulated.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.filled == self.format.width() }

    /// The declared body length.
    ///
    /// Valid only once [`Self::is_complete`] returns true.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::OversizedFrame`] when the prefix declares a body
    /// larger than the configured maximum.
    pub fn body_len(&self) -> Result<usize, ReadError> {
        debug_assert!(self.is_complete(), "length prefix not complete");
        let declared = self.format.read_len(&self.buf[..self.format.width()]);
        if declared > self.max_body_bytes as u64 {
            return Err(ReadError::OversizedFrame {
                size: declared,
                max: self.max_body_bytes,
            });
        }
        Ok(declared as usize)
    }

    /// Discard accumulated state ahead of the next frame.
    pub fn reset(&mut self) { self.filled = 0; }
}
