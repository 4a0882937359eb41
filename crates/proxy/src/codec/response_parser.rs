//! Incremental parser for the status line and headers.

use bytes::{BufMut, BytesMut};
use std::task::Poll;

use crate::codec::fields::{HeaderFieldsParser, VersionParser};
use crate::codec::PreBodyParser;
use crate::protocol::{ParseError, ResponsePreBody};
use crate::utils::{is_ctl, is_digit};
use ResponseState::*;

const STATUS_CODE_LEN: usize = 3;

/// Parses `version SP code SP reason CRLF headers CRLF` one byte at a time.
#[derive(Debug, Default)]
pub struct ResponsePreBodyParser {
    state: ResponseState,
    scratch: BytesMut,
    version: VersionParser,
    fields: HeaderFieldsParser,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    #[default]
    Version,
    Code,
    SpaceAfterCode,
    Reason,
    LineLf,
    Headers,
}

impl ResponsePreBodyParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, response: &mut ResponsePreBody, b: u8) -> Poll<Result<(), ParseError>> {
        match self.state {
            Version => {
                if self.version.consume(&mut self.scratch, b, b' ')?.is_ready() {
                    response.version = self.scratch.split().freeze();
                    self.state = Code;
                }
            }
            Code => {
                if !is_digit(b) {
                    reject!(ParseError::invalid_status(format!("unexpected byte {b:#04x} in status code")));
                }
                self.scratch.put_u8(b);
                if self.scratch.len() == STATUS_CODE_LEN {
                    response.code = self.scratch.split().freeze();
                    self.state = SpaceAfterCode;
                }
            }
            SpaceAfterCode => {
                if b != b' ' {
                    reject!(ParseError::invalid_status("missing space after status code"));
                }
                self.state = Reason;
            }
            Reason => {
                if b == b'\r' {
                    response.reason = self.scratch.split().freeze();
                    self.state = LineLf;
                } else if is_ctl(b) {
                    reject!(ParseError::invalid_status(format!("unexpected byte {b:#04x} in reason")));
                } else {
                    self.scratch.put_u8(b);
                }
            }
            LineLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_status("missing LF after status line"));
                }
                self.state = Headers;
            }
            Headers => return self.fields.consume(&mut response.headers, b),
        }
        Poll::Pending
    }
}

impl PreBodyParser for ResponsePreBodyParser {
    type Target = ResponsePreBody;

    fn parse(&mut self, response: &mut ResponsePreBody, input: &[u8]) -> (Poll<Result<(), ParseError>>, usize) {
        for (i, &b) in input.iter().enumerate() {
            match self.consume(response, b) {
                Poll::Pending => {}
                ready => return (ready, i + 1),
            }
        }
        (Poll::Pending, input.len())
    }

    fn reset(&mut self) {
        self.state = Version;
        self.scratch.clear();
        self.version.reset();
        self.fields.reset();
    }
}
