//! Building blocks shared by the pre-body and chunk parsers.

use bytes::{BufMut, BytesMut};
use std::task::Poll;

use crate::protocol::{Headers, ParseError};
use crate::utils::{is_ctl, is_digit, is_token};
use FieldState::*;
use VersionState::*;

const HTTP_PREFIX: &[u8] = b"HTTP/";

/// Parses header lines up to and including the empty line that ends them.
///
/// Folded continuation lines are joined to the previous value. Whitespace is
/// normalized while parsing: leading and trailing whitespace of a value is
/// dropped and every inner run of spaces and tabs becomes a single space.
#[derive(Debug, Default)]
pub(crate) struct HeaderFieldsParser {
    state: FieldState,
    name: BytesMut,
    value: BytesMut,
    pending_space: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FieldState {
    /// First byte of a line: a name, a fold, or the final CR
    #[default]
    LineStart,
    Name,
    Value,
    /// LF ending a header line
    ValueLf,
    /// LF ending the header block
    EndLf,
}

impl HeaderFieldsParser {
    pub(crate) fn consume(&mut self, headers: &mut Headers, b: u8) -> Poll<Result<(), ParseError>> {
        match self.state {
            LineStart => {
                if b == b' ' || b == b'\t' {
                    if self.name.is_empty() {
                        reject!(ParseError::invalid_header("continuation line without a header"));
                    }
                    self.state = Value;
                    self.pending_space = !self.value.is_empty();
                    return Poll::Pending;
                }

                self.save_if_non_empty(headers);
                if b == b'\r' {
                    self.state = EndLf;
                } else if is_token(b) {
                    self.state = Name;
                    self.name.put_u8(b);
                } else {
                    reject!(ParseError::invalid_header(format!("invalid header name byte {b:#04x}")));
                }
            }
            Name => {
                if b == b':' {
                    self.state = Value;
                } else if is_token(b) {
                    self.name.put_u8(b);
                } else {
                    reject!(ParseError::invalid_header(format!("invalid header name byte {b:#04x}")));
                }
            }
            Value => {
                if b == b'\r' {
                    self.state = ValueLf;
                } else if b == b' ' || b == b'\t' {
                    self.pending_space = !self.value.is_empty();
                } else if is_ctl(b) {
                    reject!(ParseError::invalid_header(format!("invalid header value byte {b:#04x}")));
                } else {
                    if self.pending_space {
                        self.value.put_u8(b' ');
                        self.pending_space = false;
                    }
                    self.value.put_u8(b);
                }
            }
            ValueLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_header("missing LF after header line"));
                }
                self.state = LineStart;
            }
            EndLf => {
                if b != b'\n' {
                    reject!(ParseError::invalid_header("missing LF after headers"));
                }
                return Poll::Ready(Ok(()));
            }
        }
        Poll::Pending
    }

    fn save_if_non_empty(&mut self, headers: &mut Headers) {
        if !self.name.is_empty() {
            headers.push_back(self.name.split().freeze(), self.value.split().freeze());
            self.pending_space = false;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = LineStart;
        self.name.clear();
        self.value.clear();
        self.pending_space = false;
    }
}

/// Parses `HTTP/<digits>.<digits>` followed by a terminator byte.
#[derive(Debug, Default)]
pub(crate) struct VersionParser {
    state: VersionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionState {
    Prefix(usize),
    MajorStart,
    Major,
    MinorStart,
    Minor,
}

impl Default for VersionState {
    fn default() -> Self {
        Prefix(0)
    }
}

impl VersionParser {
    /// Completes once `terminator` follows the minor version; the terminator is not stored.
    pub(crate) fn consume(&mut self, version: &mut BytesMut, b: u8, terminator: u8) -> Poll<Result<(), ParseError>> {
        self.state = match self.state {
            Prefix(i) if HTTP_PREFIX.get(i) == Some(&b) => {
                if i + 1 == HTTP_PREFIX.len() { MajorStart } else { Prefix(i + 1) }
            }
            Prefix(_) => reject!(ParseError::invalid_version("expected HTTP/")),
            MajorStart if is_digit(b) => Major,
            Major if is_digit(b) => Major,
            Major if b == b'.' => MinorStart,
            MinorStart if is_digit(b) => Minor,
            Minor if is_digit(b) => Minor,
            Minor if b == terminator => return Poll::Ready(Ok(())),
            _ => reject!(ParseError::invalid_version(format!("unexpected byte {b:#04x}"))),
        };
        version.put_u8(b);
        Poll::Pending
    }

    pub(crate) fn reset(&mut self) {
        self.state = VersionState::default();
    }
}
