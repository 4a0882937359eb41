//! Incremental parser for the request line and headers.

use bytes::{BufMut, BytesMut};
use std::task::Poll;

use crate::codec::fields::{HeaderFieldsParser, VersionParser};
use crate::codec::PreBodyParser;
use crate::protocol::{ParseError, RequestPreBody};
use crate::utils::{is_ctl, is_token};
use RequestState::*;

/// Parses `method SP uri SP version CRLF headers CRLF` one byte at a time.
///
/// Input may arrive in arbitrary pieces; the parser keeps whatever it needs
/// between calls. Fields are written to the target as soon as they are
/// complete, and [`reset`](PreBodyParser::reset) prepares for the next
/// request on the same connection.
#[derive(Debug, Default)]
pub struct RequestPreBodyParser {
    state: RequestState,
    scratch: BytesMut,
    version: VersionParser,
    fields: HeaderFieldsParser,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    #[default]
    MethodStart,
    Method,
    Uri,
    Version,
    /// LF after the request line
    LineLf,
    Headers,
}

impl RequestPreBodyParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, request: &mut RequestPreBody, b: u8) -> Poll<Result<(), ParseError>> {
        match self.state {
            MethodStart => {
                if !is_token(b) {
                    reject!(ParseError::invalid_method(format!("unexpected byte {b:#04x}")));
                }
                self.scratch.put_u8(b);
                self.state = Method;
            }
            Method => {
                if b == b' ' {
                    request.method = self.scratch.split().freeze();
                    self.state = Uri;
                } else if is_token(b) {
                    self.scratch.put_u8(b);
                } else {
                    reject!(ParseError::invalid_method(format!("unexpected byte {b:#04x}")));
                }
            }
            Uri => {
                if b == b' ' {
                    request.uri = self.scratch.split().freeze();
                    self.state = Version;
                } else if is_ctl(b) {
                    reject!(ParseError::invalid_uri(format!("unexpected byte {b:#04x}")));
                } else {
                    self.scratch.put_u8(b);
                }
            }
            Version => {
                if self.version.consume(&mut self.scratch, b, b'\r')?.is_ready() {
                    request.version = self.scratch.split().freeze();
                    self.state = LineLf;
                }
            }
            LineLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_version("missing LF after request line"));
                }
                self.state = Headers;
            }
            Headers => return self.fields.consume(&mut request.headers, b),
        }
        Poll::Pending
    }
}

impl PreBodyParser for RequestPreBodyParser {
    type Target = RequestPreBody;

    fn parse(&mut self, request: &mut RequestPreBody, input: &[u8]) -> (Poll<Result<(), ParseError>>, usize) {
        for (i, &b) in input.iter().enumerate() {
            match self.consume(request, b) {
                Poll::Pending => {}
                ready => return (ready, i + 1),
            }
        }
        (Poll::Pending, input.len())
    }

    fn reset(&mut self) {
        self.state = MethodStart;
        self.scratch.clear();
        self.version.reset();
        self.fields.reset();
    }
}
