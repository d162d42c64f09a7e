//! Frame-body accumulation and decoding.

use std::sync::Arc;

use bytes::BytesMut;

use crate::factory::{CodecError, Message, MessageFactory};

/// Accumulates the body of one frame up to its declared size, then runs the
/// codec over the contiguous bytes.
///
/// Bytes beyond the declared size are never consumed; they belong to the
/// next frame and stay with the caller.
pub struct BodyReader<F: MessageFactory> {
    factory: Arc<F>,
    expected: Option<usize>,
    received: usize,
    buf: BytesMut,
    message: Option<Message<F::Output>>,
}

impl<F: MessageFactory> BodyReader<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self {
            factory,
            expected: None,
            received: 0,
            buf: BytesMut::new(),
            message: None,
        }
    }

    /// Install the declared body size. Idempotent once set for the current
    /// frame; a zero-length body completes immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if a zero-length body is rejected by the
    /// codec.
    pub fn set_size(&mut self, declared: usize) -> Result<(), CodecError> {
        if self.expected.is_some() {
            return Ok(());
        }
        self.expected = Some(declared);
        if declared == 0 {
            self.finish()?;
        }
        Ok(())
    }

    /// Consume body bytes from `input`, returning how many were taken.
    ///
    /// Completing the body runs the codec.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the completed body fails to decode.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, CodecError> {
        let expected = self.expected.expect("body size not installed");
        let take = (expected - self.received).min(input.len());
        self.buf.extend_from_slice(&input[..take]);
        self.received += take;
        if self.received == expected && self.message.is_none() {
            self.finish()?;
        }
        Ok(take)
    }

    /// Body bytes consumed so far for the current frame.
    #[must_use]
    pub fn received(&self) -> usize { self.received }

    /// Whether the frame body is complete and decoded.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.message.is_some() }

    /// Take the decoded message, if the body completed.
    pub fn take_message(&mut self) -> Option<Message<F::Output>> { self.message.take() }

    /// Discard accumulated state ahead of the next frame. The internal
    /// buffer keeps its capacity.
    pub fn reset(&mut self) {
        self.expected = None;
        self.received = 0;
        self.buf.clear();
        self.message = None;
    }

    fn finish(&mut self) -> Result<(), CodecError> {
        let raw = self.buf.split().freeze();
        let value = self.factory.create(&raw)?;
        self.message = Some(Message::new(value, raw));
        Ok(())
    }
}
