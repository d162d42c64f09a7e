//! Message codecs.
//!
//! A [`MessageFactory`] turns the body bytes of a completed frame into an
//! application-level value. The runtime wraps the value together with the
//! raw bytes it came from in a [`Message`], so response refiners can
//! correlate a request with its response.
//!
//! Two factories ship with the crate: [`BincodeFactory`] decodes bodies with
//! `bincode`'s standard configuration, and [`RawFactory`] hands the body
//! bytes through untouched.

use std::{error::Error, marker::PhantomData};

use bytes::Bytes;
use thiserror::Error as ThisError;

/// Errors produced by a [`MessageFactory`].
#[derive(Debug, ThisError)]
pub enum CodecError {
    /// The body bytes could not be decoded into a message value.
    #[error("message decode failed: {source}")]
    Decode {
        /// Underlying decoder error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The decoder accepted the body but left bytes unconsumed.
    #[error("message body has {unconsumed} trailing bytes")]
    TrailingBytes {
        /// Number of body bytes the decoder did not consume.
        unconsumed: usize,
    },
}

impl CodecError {
    /// Wrap an arbitrary decoder error.
    pub fn decode(source: impl Error + Send + Sync + 'static) -> Self {
        Self::Decode {
            source: Box::new(source),
        }
    }
}

/// A decoded message and the raw frame body it was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<T> {
    value: T,
    raw: Bytes,
}

impl<T> Message<T> {
    /// Pair a decoded value with its source bytes.
    #[must_use]
    pub fn new(value: T, raw: Bytes) -> Self { Self { value, raw } }

    /// The decoded application value.
    #[must_use]
    pub fn value(&self) -> &T { &self.value }

    /// The raw frame body this message was decoded from.
    #[must_use]
    pub fn raw(&self) -> &Bytes { &self.raw }

    /// Consume the message, returning the decoded value.
    #[must_use]
    pub fn into_value(self) -> T { self.value }
}

/// Byte-to-message codec plugged into the server.
///
/// Implementations must be pure with respect to connection state: `create`
/// is handed one complete frame body at a time and may allocate freely.
pub trait MessageFactory: Send + Sync + 'static {
    /// The decoded message type.
    type Output: Send + 'static;

    /// Width of the length prefix in bytes.
    fn header_size(&self) -> usize;

    /// Decode one frame body.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the bytes do not form a valid message;
    /// the connection that produced them is closed.
    fn create(&self, body: &[u8]) -> Result<Self::Output, CodecError>;
}

/// Factory decoding frame bodies with `bincode`'s standard configuration.
pub struct BincodeFactory<M> {
    header_size: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> BincodeFactory<M> {
    /// Create a factory with the default 4-byte length prefix.
    #[must_use]
    pub fn new() -> Self { Self::with_header_size(4) }

    /// Create a factory declaring a custom prefix width.
    #[must_use]
    pub fn with_header_size(header_size: usize) -> Self {
        Self {
            header_size,
            _message: PhantomData,
        }
    }
}

impl<M> Default for BincodeFactory<M> {
    fn default() -> Self { Self::new() }
}

impl<M> MessageFactory for BincodeFactory<M>
where
    M: bincode::Decode<()> + Send + 'static,
{
    type Output = M;

    fn header_size(&self) -> usize { self.header_size }

    fn create(&self, body: &[u8]) -> Result<M, CodecError> {
        let (value, consumed) =
            bincode::decode_from_slice(body, bincode::config::standard())
                .map_err(CodecError::decode)?;
        if consumed != body.len() {
            return Err(CodecError::TrailingBytes {
                unconsumed: body.len() - consumed,
            });
        }
        Ok(value)
    }
}

/// Factory that passes frame bodies through as raw bytes.
#[derive(Clone, Copy, Debug)]
pub struct RawFactory {
    header_size: usize,
}

impl RawFactory {
    /// Create a raw factory with the default 4-byte length prefix.
    #[must_use]
    pub const fn new() -> Self { Self { header_size: 4 } }

    /// Create a raw factory declaring a custom prefix width.
    #[must_use]
    pub const fn with_header_size(header_size: usize) -> Self { Self { header_size } }
}

impl Default for RawFactory {
    fn default() -> Self { Self::new() }
}

impl MessageFactory for RawFactory {
    type Output = Bytes;

    fn header_size(&self) -> usize { self.header_size }

    fn create(&self, body: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn bincode_factory_round_trips() {
        let factory = BincodeFactory::<Ping>::new();
        let original = Ping {
            seq: 7,
            note: "lookup".into(),
        };
        let body = bincode::encode_to_vec(&original, bincode::config::standard())
            .expect("encodable test value");
        assert_eq!(factory.create(&body).expect("decodes"), original);
    }

    #[test]
    fn bincode_factory_rejects_trailing_bytes() {
        let factory = BincodeFactory::<u32>::new();
        let mut body = bincode::encode_to_vec(3u32, bincode::config::standard())
            .expect("encodable test value");
        body.push(0xff);
        assert!(matches!(
            factory.create(&body),
            Err(CodecError::TrailingBytes { unconsumed: 1 })
        ));
    }

    #[test]
    fn raw_factory_copies_body() {
        let factory = RawFactory::new();
        assert_eq!(factory.create(b"abc").expect("infallible"), Bytes::from_static(b"abc"));
        assert_eq!(factory.header_size(), 4);
    }
}
