//! Canned responses the proxy writes itself when a message can not be forwarded.

use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};

use crate::protocol::OutgoingBuffers;

/// Builds a complete `HTTP/1.0` reply for `status` with a small html body naming it.
///
/// The proxy answers malformed client input with `400 Bad Request` and malformed upstream
/// input with `502 Bad Gateway`.
pub fn stock_reply(status: StatusCode) -> OutgoingBuffers {
    let reason = status.canonical_reason().unwrap_or_default();
    let code = status.as_str();
    let content = format!(
        "<html><head><title>{reason}</title></head><body><h1>{code} {reason}</h1></body></html>"
    );
    let head = format!(
        "HTTP/1.0 {code} {reason}\r\n{}: {}\r\n{}: {}\r\n\r\n",
        header_case(CONTENT_LENGTH.as_str()),
        content.len(),
        header_case(CONTENT_TYPE.as_str()),
        mime::TEXT_HTML.essence_str(),
    );

    let mut buffers = OutgoingBuffers::new();
    buffers.push(Bytes::from(head));
    buffers.push(Bytes::from(content));
    buffers
}

/// `content-length` to `Content-Length`.
fn header_case(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map(|c| c.to_ascii_uppercase().to_string() + chars.as_str()).unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("-")
}
