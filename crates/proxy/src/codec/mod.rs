//! Incremental parsers for the HTTP/1.x wire format.
//!
//! Every parser here is a byte-at-a-time state machine that may be fed input
//! in arbitrary pieces:
//!
//! - [`RequestPreBodyParser`]: request line and headers
//! - [`ResponsePreBodyParser`]: status line and headers
//! - [`ChunkParser`]: one chunk of a chunked body, including the trailer
//! - [`ChunkedBodyParser`]: a whole chunked body, chunk after chunk
//! - [`FixedLengthBodyParser`]: a body of known length
//!
//! `parse` returns the tri-state result as a [`Poll`](std::task::Poll):
//! `Pending` asks for more input, `Ready(Ok(()))` marks the end of the message
//! part and `Ready(Err(_))` rejects it. It also returns how much of the input
//! was consumed, so leftovers can be handed to the next parser.
//!
//! The pre-body parsers are also available as [`tokio_util::codec::Decoder`]s
//! through [`PreBodyDecoder`].

/// Returns early from a `consume` step with a parse error.
macro_rules! reject {
    ($error:expr) => {
        return ::std::task::Poll::Ready(Err($error))
    };
}

mod body_parser;
mod chunk_parser;
mod decoder;
mod fields;
mod request_parser;
mod response_parser;

use std::fmt::Debug;
use std::task::Poll;

use crate::protocol::ParseError;

pub use body_parser::{ChunkedBodyParser, ChunkedProgress, FixedLengthBodyParser};
pub use chunk_parser::ChunkParser;
pub use decoder::{PreBodyDecoder, RequestPreBodyDecoder, ResponsePreBodyDecoder};
pub use request_parser::RequestPreBodyParser;
pub use response_parser::ResponsePreBodyParser;

/// A parser producing a request or response pre-body.
pub trait PreBodyParser: Default + Debug {
    type Target: Default + Debug;

    /// Feeds `input` to the parser; see the [module documentation](self) for the result.
    fn parse(&mut self, target: &mut Self::Target, input: &[u8]) -> (Poll<Result<(), ParseError>>, usize);

    /// Forgets any partial state, ready for the next message.
    fn reset(&mut self);
}
