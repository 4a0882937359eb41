//! [`Decoder`] adapters over the incremental pre-body parsers.

use bytes::{Buf, BytesMut};
use std::task::Poll;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::{PreBodyParser, RequestPreBodyParser, ResponsePreBodyParser};
use crate::protocol::ParseError;

/// Yields one complete pre-body per call once enough bytes were buffered.
///
/// Consumed bytes are advanced off the source buffer, so whatever follows the
/// pre-body (usually the body) stays in place for the next decoder.
#[derive(Debug, Default)]
pub struct PreBodyDecoder<P: PreBodyParser> {
    parser: P,
    target: P::Target,
}

pub type RequestPreBodyDecoder = PreBodyDecoder<RequestPreBodyParser>;
pub type ResponsePreBodyDecoder = PreBodyDecoder<ResponsePreBodyParser>;

impl<P: PreBodyParser> PreBodyDecoder<P> {
    pub fn new() -> Self {
        Self { parser: P::default(), target: P::Target::default() }
    }
}

impl<P: PreBodyParser> Decoder for PreBodyDecoder<P> {
    type Item = P::Target;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let (result, consumed) = self.parser.parse(&mut self.target, src);
        src.advance(consumed);
        trace!(consumed, "decoded pre body bytes");

        match result {
            Poll::Pending => Ok(None),
            Poll::Ready(Ok(())) => {
                self.parser.reset();
                Ok(Some(std::mem::take(&mut self.target)))
            }
            Poll::Ready(Err(e)) => Err(e),
        }
    }
}
