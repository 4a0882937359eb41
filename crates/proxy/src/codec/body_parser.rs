//! Body framing parsers: chunked bodies and bodies of known length.

use std::task::Poll;

use crate::codec::ChunkParser;
use crate::protocol::{Chunk, ParseError, Trailer};

/// Result of [`ChunkedBodyParser::parse`].
#[derive(Debug)]
pub struct ChunkedProgress {
    pub result: Poll<Result<(), ParseError>>,
    /// Bytes of the input consumed by the parser.
    pub consumed: usize,
    /// End of the input that belongs to chunks known not to be the last one.
    ///
    /// Everything before it can be forwarded as is. The framing of the last
    /// chunk is never forwarded; it is regenerated from the [`Trailer`].
    pub forwardable: usize,
}

/// Drives a [`ChunkParser`] over every chunk of a chunked body.
#[derive(Debug, Default)]
pub struct ChunkedBodyParser {
    chunk: Chunk,
    chunk_parser: ChunkParser,
}

impl ChunkedBodyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the next piece of a chunked body.
    ///
    /// Complete non-empty chunks are consumed one after another. While the size of
    /// the current chunk still reads as zero the chunk may turn out to be the
    /// last one, so its bytes are consumed but not reported as forwardable.
    pub fn parse(&mut self, trailer: &mut Trailer, input: &[u8]) -> ChunkedProgress {
        let mut consumed = 0;
        let mut forwardable = 0;

        while consumed < input.len() {
            let (result, n) = self.chunk_parser.parse(&mut self.chunk, trailer, &input[consumed..]);
            consumed += n;

            match result {
                Poll::Ready(Ok(())) if self.chunk.length == 0 => {
                    return ChunkedProgress { result, consumed, forwardable };
                }
                Poll::Ready(Ok(())) => {
                    self.chunk = Chunk::default();
                    self.chunk_parser.reset();
                }
                Poll::Ready(Err(_)) => return ChunkedProgress { result, consumed, forwardable },
                Poll::Pending if self.chunk.length == 0 => break,
                Poll::Pending => {}
            }
            forwardable = consumed;
        }

        ChunkedProgress { result: Poll::Pending, consumed, forwardable }
    }

    pub fn reset(&mut self) {
        self.chunk = Chunk::default();
        self.chunk_parser.reset();
    }
}

/// Counts down the bytes of a body whose length is known up front.
#[derive(Debug, Default)]
pub struct FixedLengthBodyParser {
    remaining: u64,
}

impl FixedLengthBodyParser {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub fn reset(&mut self, length: u64) {
        self.remaining = length;
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Consumes up to the remaining length of `input` in one step.
    ///
    /// Returns `Poll::Ready(())` once the whole body has been seen, together with the
    /// number of bytes taken from `input`.
    pub fn parse(&mut self, input: &[u8]) -> (Poll<()>, usize) {
        let available = input.len() as u64;
        if available >= self.remaining {
            // remaining <= input.len(), so it fits in usize
            let consumed = usize::try_from(self.remaining).unwrap_or(input.len());
            self.remaining = 0;
            (Poll::Ready(()), consumed)
        } else {
            self.remaining -= available;
            (Poll::Pending, input.len())
        }
    }
}
