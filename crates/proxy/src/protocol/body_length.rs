//! Body framing detection.
//!
//! `Transfer-Encoding` wins over `Content-Length`: a message is chunked when
//! any of its `Transfer-Encoding` values ends with `chunked`, in any case. Otherwise the
//! first `Content-Length` decides, and a message with neither header has no
//! declared length at all.

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::StatusCode;

use crate::protocol::{BodyLength, Headers, ParseError, RequestPreBody, ResponsePreBody};
use crate::utils::parse_decimal_u64;

const CHUNKED: &[u8] = b"chunked";

/// Detects how the body following `headers` is framed.
///
/// # Errors
///
/// Returns [`ParseError::InvalidContentLength`] when the `Content-Length` value holds a
/// non-digit or exceeds `u64::MAX`. An empty value counts as `0`.
pub fn detect_body_length(headers: &Headers) -> Result<BodyLength, ParseError> {
    if headers.find(TRANSFER_ENCODING.as_str()).any(|h| ends_with_chunked(h.value())) {
        return Ok(BodyLength::Chunked);
    }

    match headers.get(CONTENT_LENGTH.as_str()) {
        Some(value) => parse_decimal_u64(value)
            .map(BodyLength::ContentLength)
            .ok_or_else(|| ParseError::invalid_content_length(String::from_utf8_lossy(value))),
        None => Ok(BodyLength::NotSpecified),
    }
}

fn ends_with_chunked(value: &[u8]) -> bool {
    value.len() >= CHUNKED.len() && value[value.len() - CHUNKED.len()..].eq_ignore_ascii_case(CHUNKED)
}

/// Requests never have an unbounded body: without framing there is no body.
pub fn request_has_body(body_length: BodyLength) -> bool {
    match body_length {
        BodyLength::Chunked => true,
        BodyLength::ContentLength(length) => length > 0,
        BodyLength::NotSpecified => false,
    }
}

/// Responses without framing run until the upstream closes the connection.
pub fn response_has_body(body_length: BodyLength) -> bool {
    !matches!(body_length, BodyLength::ContentLength(0))
}

/// Whether a body may follow `response` at all, whatever its headers say.
///
/// Responses to `HEAD`, informational responses, `204` and `304` never carry one.
pub fn should_response_have_body(request: &RequestPreBody, response: &ResponsePreBody) -> bool {
    if request.is_head() {
        return false;
    }
    if response.code.len() > 1 && response.code.starts_with(b"1") {
        return false;
    }
    !matches!(response.status(), Some(StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED))
}
