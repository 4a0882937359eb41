//! Incremental parser for one chunk of a chunked body.
//!
//! A chunk is `size-in-hex [;extension] CRLF data CRLF`. When the size is
//! zero the chunk is the last one: trailer header lines follow instead of
//! data, ended by an empty line. Only the last chunk's extension is kept, on
//! the [`Trailer`].

use bytes::{BufMut, BytesMut};
use std::task::Poll;

use crate::codec::fields::HeaderFieldsParser;
use crate::protocol::{Chunk, ParseError, Trailer};
use crate::utils::{MAX_BEFORE_LAST_HEX_DIGIT, hex_digit_value, is_ctl};
use ChunkState::*;

#[derive(Debug, Default)]
pub struct ChunkParser {
    state: ChunkState,
    remaining: u64,
    extension: BytesMut,
    trailer_fields: HeaderFieldsParser,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    #[default]
    Size,
    Extension,
    /// LF after the size line
    SizeLf,
    Data,
    /// LF after the data of a non-empty chunk
    DataLf,
    TrailerFields,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses as much of `input` as belongs to the current chunk.
    ///
    /// # Returns
    ///
    /// The parse result and the number of bytes consumed:
    /// - `Poll::Ready(Ok(()))` once the whole chunk is parsed, `chunk.length` tells whether it was the last one
    /// - `Poll::Pending` when `input` ran out first
    /// - `Poll::Ready(Err(_))` on malformed input
    ///
    /// Chunk data is skipped in bulk rather than byte by byte.
    pub fn parse(&mut self, chunk: &mut Chunk, trailer: &mut Trailer, input: &[u8]) -> (Poll<Result<(), ParseError>>, usize) {
        let mut pos = 0;
        while pos < input.len() {
            if self.state == Data && self.remaining > 0 {
                let available = (input.len() - pos) as u64;
                if available <= self.remaining {
                    self.remaining -= available;
                    return (Poll::Pending, input.len());
                }
                // remaining < available, so it fits in usize
                pos += usize::try_from(self.remaining).unwrap_or(usize::MAX);
                self.remaining = 0;
                continue;
            }

            let b = input[pos];
            pos += 1;
            match self.consume(chunk, trailer, b) {
                Poll::Pending => {}
                ready => return (ready, pos),
            }
        }
        (Poll::Pending, pos)
    }

    fn consume(&mut self, chunk: &mut Chunk, trailer: &mut Trailer, b: u8) -> Poll<Result<(), ParseError>> {
        match self.state {
            Size => match b {
                b'\r' => self.state = SizeLf,
                b';' => {
                    self.extension.put_u8(b);
                    self.state = Extension;
                }
                _ => {
                    let Some(digit) = hex_digit_value(b) else {
                        reject!(ParseError::invalid_chunk_size(format!("unexpected byte {b:#04x}")));
                    };
                    if chunk.length > MAX_BEFORE_LAST_HEX_DIGIT {
                        reject!(ParseError::invalid_chunk_size("chunk size overflow"));
                    }
                    chunk.length = chunk.length * 16 + u64::from(digit);
                }
            },
            Extension => {
                if b == b'\r' {
                    self.state = SizeLf;
                } else if is_ctl(b) {
                    reject!(ParseError::invalid_chunk_extension(format!("unexpected byte {b:#04x}")));
                } else {
                    self.extension.put_u8(b);
                }
            }
            SizeLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_chunk_size("missing LF after chunk size"));
                }
                self.remaining = chunk.length;
                if chunk.length == 0 {
                    trailer.extension = self.extension.split().freeze();
                    self.state = TrailerFields;
                } else {
                    self.state = Data;
                }
            }
            Data => {
                // only reached once the data has been skipped
                if b != b'\r' {
                    reject!(ParseError::invalid_chunk_data("missing CR after chunk data"));
                }
                self.state = DataLf;
            }
            DataLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_chunk_data("missing LF after chunk data"));
                }
                return Poll::Ready(Ok(()));
            }
            TrailerFields => return self.trailer_fields.consume(&mut trailer.headers, b),
        }
        Poll::Pending
    }

    pub fn reset(&mut self) {
        self.state = Size;
        self.remaining = 0;
        self.extension.clear();
        self.trailer_fields.reset();
    }
}
