//! Core HTTP message types seen by the proxy engine and its callbacks.
//!
//! This module contains the wire models the proxy reads, rewrites and writes:
//!
//! - [`Headers`]: an ordered, case-insensitive multi-map keeping wire order
//! - [`RequestPreBody`] and [`ResponsePreBody`]: start line plus headers
//! - [`Trailer`] and [`Chunk`]: the pieces of a chunked body
//! - [`BodyLength`]: how a body is framed, see [`detect_body_length`]
//! - [`OutgoingBuffers`]: byte views queued for the next socket write
//!
//! Unlike a server framework, a proxy has to reproduce whatever it did not
//! change byte for byte, so every model keeps raw [`bytes::Bytes`] fields
//! instead of typed `http` values. Typed accessors are offered where useful.

mod body_length;
mod buffers;
mod error;
mod headers;
mod message;
mod reply;

pub use body_length::{detect_body_length, request_has_body, response_has_body, should_response_have_body};
pub use buffers::OutgoingBuffers;
pub use error::ParseError;
pub use headers::{Find, Header, Headers};
pub use message::{BodyLength, Chunk, RequestPreBody, ResponsePreBody, Trailer, is_connection_close};
pub use reply::stock_reply;
