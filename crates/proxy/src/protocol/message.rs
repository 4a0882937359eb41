//! Pre-body models of requests and responses, plus the chunk and trailer records.
//!
//! These are scratch objects: a connection owns one of each and resets them to
//! their [`Default`] between requests. Every text field is stored as [`Bytes`]
//! so that serialization through [`to_buffers`](RequestPreBody::to_buffers)
//! only clones reference counts.

use bytes::Bytes;
use http::StatusCode;
use http::header::{CONNECTION, EXPECT};

use crate::protocol::{Headers, OutgoingBuffers};
use crate::utils::eq_ignore_lowercase;

const SP: &[u8] = b" ";
const CRLF: &[u8] = b"\r\n";
const NAME_VALUE_SEPARATOR: &[u8] = b": ";
const LAST_CHUNK_PREFIX: &[u8] = b"0";

pub(crate) const HTTP_1_1: &[u8] = b"HTTP/1.1";

/// The request line and the headers of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestPreBody {
    pub method: Bytes,
    pub uri: Bytes,
    pub version: Bytes,
    pub headers: Headers,
}

impl RequestPreBody {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    /// Serializes as `method SP uri SP version CRLF (name ": " value CRLF)* CRLF`.
    pub fn to_buffers(&self) -> OutgoingBuffers {
        let mut buffers = OutgoingBuffers::new();
        buffers.push(self.method.clone());
        buffers.push_static(SP);
        buffers.push(self.uri.clone());
        buffers.push_static(SP);
        buffers.push(self.version.clone());
        buffers.push_static(CRLF);
        write_headers(&self.headers, &mut buffers);
        buffers
    }

    /// Returns true if the client asked the next hop to wait for `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers.get(EXPECT.as_str()).is_some_and(|value| eq_ignore_lowercase(value, b"100-continue"))
    }
}

/// The status line and the headers of a response.
#[derive(Debug, Clone, Default)]
pub struct ResponsePreBody {
    pub version: Bytes,
    pub code: Bytes,
    pub reason: Bytes,
    pub headers: Headers,
}

impl ResponsePreBody {
    /// Serializes as `version SP code SP reason CRLF (name ": " value CRLF)* CRLF`.
    pub fn to_buffers(&self) -> OutgoingBuffers {
        let mut buffers = OutgoingBuffers::new();
        buffers.push(self.version.clone());
        buffers.push_static(SP);
        buffers.push(self.code.clone());
        buffers.push_static(SP);
        buffers.push(self.reason.clone());
        buffers.push_static(CRLF);
        write_headers(&self.headers, &mut buffers);
        buffers
    }

    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_bytes(&self.code).ok()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.code = Bytes::copy_from_slice(status.as_str().as_bytes());
        self.reason = Bytes::from_static(status.canonical_reason().unwrap_or_default().as_bytes());
    }

    pub fn is_continue(&self) -> bool {
        self.code == "100"
    }
}

/// Chunk extension and trailer headers of the last chunk of a chunked body.
#[derive(Debug, Clone, Default)]
pub struct Trailer {
    /// Extension text including its leading `;`, or empty.
    pub extension: Bytes,
    pub headers: Headers,
}

impl Trailer {
    /// Serializes the last chunk: `"0" extension CRLF (name ": " value CRLF)* CRLF`.
    pub fn to_buffers(&self) -> OutgoingBuffers {
        let mut buffers = OutgoingBuffers::new();
        buffers.push_static(LAST_CHUNK_PREFIX);
        buffers.push(self.extension.clone());
        buffers.push_static(CRLF);
        write_headers(&self.headers, &mut buffers);
        buffers
    }
}

/// The declared size of the chunk being parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub length: u64,
}

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    ContentLength(u64),
    Chunked,
    /// No framing header: a request has no body, a response runs until the upstream closes.
    NotSpecified,
}

/// Whether a message with `version` and `headers` ends its connection.
///
/// Anything but `HTTP/1.1` closes, as does `Connection: close`. A missing `Connection`
/// header on `HTTP/1.1` keeps the connection alive.
pub fn is_connection_close(version: &[u8], headers: &Headers) -> bool {
    version != HTTP_1_1 || headers.get(CONNECTION.as_str()).is_some_and(|value| eq_ignore_lowercase(value, b"close"))
}

fn write_headers(headers: &Headers, buffers: &mut OutgoingBuffers) {
    for header in headers.iter() {
        buffers.push(header.name().clone());
        buffers.push_static(NAME_VALUE_SEPARATOR);
        buffers.push(header.value.clone());
        buffers.push_static(CRLF);
    }
    buffers.push_static(CRLF);
}
