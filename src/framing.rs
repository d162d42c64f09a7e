//! Length-prefix framing.
//!
//! Every wire unit is a fixed-size unsigned length prefix followed by exactly
//! that many body bytes. [`LengthFormat`] describes the prefix; responses are
//! framed with [`LengthFormat::frame_payload`], which produces one contiguous
//! buffer so the prefix and payload cannot be torn across separate writes.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Byte order used for encoding and decoding length prefixes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

/// Errors raised when framing an outbound payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The payload length cannot be represented in the prefix width.
    #[error("payload length {len} exceeds {width}-byte prefix capacity {max}")]
    LengthOverflow {
        /// Length of the rejected payload.
        len: usize,
        /// Configured prefix width in bytes.
        width: usize,
        /// Largest length the prefix can carry.
        max: u64,
    },
}

/// Format of the length prefix preceding each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthFormat {
    width: usize,
    endianness: Endianness,
}

impl LengthFormat {
    /// Creates a new `LengthFormat` with the given prefix width and byte
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not in `1..=8`.
    #[must_use]
    pub const fn new(width: usize, endianness: Endianness) -> Self {
        assert!(matches!(width, 1..=8), "invalid length-prefix width");
        Self { width, endianness }
    }

    /// Creates a `LengthFormat` for a 4-byte big-endian prefix, the wire
    /// default.
    #[must_use]
    pub const fn u32_be() -> Self { Self::new(4, Endianness::Big) }

    /// Creates a `LengthFormat` for a 2-byte big-endian prefix.
    #[must_use]
    pub const fn u16_be() -> Self { Self::new(2, Endianness::Big) }

    /// Prefix width in bytes.
    #[must_use]
    pub const fn width(&self) -> usize { self.width }

    /// Largest body length representable by this prefix.
    #[must_use]
    pub const fn max_representable(&self) -> u64 {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }

    /// Decode a length prefix from `bytes`.
    ///
    /// `bytes` must hold exactly one prefix.
    #[must_use]
    pub fn read_len(&self, bytes: &[u8]) -> u64 {
        debug_assert_eq!(bytes.len(), self.width, "prefix slice width mismatch");
        let mut wide = [0u8; 8];
        match self.endianness {
            Endianness::Big => {
                wide[8 - self.width..].copy_from_slice(bytes);
                u64::from_be_bytes(wide)
            }
            Endianness::Little => {
                wide[..self.width].copy_from_slice(bytes);
                u64::from_le_bytes(wide)
            }
        }
    }

    /// Append `len` to `dst` using this prefix encoding.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::LengthOverflow`] if `len` does not fit in the
    /// prefix width.
    pub fn write_len(&self, len: usize, dst: &mut BytesMut) -> Result<(), FramingError> {
        let max = self.max_representable();
        if len as u64 > max {
            return Err(FramingError::LengthOverflow {
                len,
                width: self.width,
                max,
            });
        }
        match self.endianness {
            Endianness::Big => dst.put_slice(&(len as u64).to_be_bytes()[8 - self.width..]),
            Endianness::Little => dst.put_slice(&(len as u64).to_le_bytes()[..self.width]),
        }
        Ok(())
    }

    /// Build one contiguous frame: length prefix immediately followed by
    /// `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::LengthOverflow`] if the payload is too large
    /// for the prefix width.
    pub fn frame_payload(&self, payload: &[u8]) -> Result<BytesMut, FramingError> {
        let mut framed = BytesMut::with_capacity(self.width + payload.len());
        self.write_len(payload.len(), &mut framed)?;
        framed.put_slice(payload);
        Ok(framed)
    }
}

impl Default for LengthFormat {
    fn default() -> Self { Self::u32_be() }
}
