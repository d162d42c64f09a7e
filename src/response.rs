//! Response assembly: refinement chain plus length-prefix framing.

use bytes::BytesMut;

use crate::{
    framing::{FramingError, LengthFormat},
    handler::ResponseRefiner,
};

/// Applies the ordered refiner chain to a handler's response and frames the
/// result for the wire.
pub struct ResponseAssembly<T> {
    refiners: Vec<Box<dyn ResponseRefiner<T>>>,
    format: LengthFormat,
}

impl<T> ResponseAssembly<T> {
    pub(crate) fn new(refiners: Vec<Box<dyn ResponseRefiner<T>>>, format: LengthFormat) -> Self {
        Self { refiners, format }
    }

    /// Run every refiner in registration order over `response`, then prepend
    /// the length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::LengthOverflow`] when the refined payload no
    /// longer fits the prefix width; the response is dropped by the caller.
    pub fn refine_and_frame(
        &self,
        request: &T,
        response: BytesMut,
    ) -> Result<BytesMut, FramingError> {
        let mut refined = response;
        for refiner in &self.refiners {
            refined = refiner.execute(request, refined);
        }
        self.format.frame_payload(&refined)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn refiners_run_in_registration_order() {
        let suffix_a = |_req: &u32, mut buf: BytesMut| {
            buf.put_u8(b'a');
            buf
        };
        let suffix_b = |_req: &u32, mut buf: BytesMut| {
            buf.put_u8(b'b');
            buf
        };
        let assembly = ResponseAssembly::new(
            vec![Box::new(suffix_a), Box::new(suffix_b)],
            LengthFormat::u32_be(),
        );
        let framed = assembly
            .refine_and_frame(&0, BytesMut::from(&b"r"[..]))
            .expect("payload fits prefix");
        assert_eq!(&framed[..], b"\x00\x00\x00\x03rab");
    }

    #[test]
    fn empty_chain_only_frames() {
        let assembly = ResponseAssembly::<u32>::new(Vec::new(), LengthFormat::u32_be());
        let framed = assembly
            .refine_and_frame(&0, BytesMut::from(&b"plain"[..]))
            .expect("payload fits prefix");
        assert_eq!(&framed[..], b"\x00\x00\x00\x05plain");
    }
}
