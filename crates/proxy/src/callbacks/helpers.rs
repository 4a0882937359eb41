//! Building blocks for callbacks that rewrite or synthesize messages.

use bytes::Bytes;
use http::StatusCode;

use crate::protocol::{OutgoingBuffers, RequestPreBody, ResponsePreBody};

const CRLF: &[u8] = b"\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Queues the size line of a chunk: lowercase hex `length` followed by CRLF.
pub fn write_chunk_prefix(length: u64, buffers: &mut OutgoingBuffers) {
    buffers.push(format!("{length:x}\r\n"));
}

/// Queues the CRLF closing the data of a chunk.
pub fn write_chunk_suffix(buffers: &mut OutgoingBuffers) {
    buffers.push_static(CRLF);
}

/// Turns `response` into a `200 OK` carrying `body` and replaces `buffers` with it.
///
/// The version is taken from `request` and a `Content-Length` header matching `body`
/// is appended to the headers already present on `response`.
pub fn write_200_response_with_length(
    request: &RequestPreBody,
    response: &mut ResponsePreBody,
    body: impl Into<Bytes>,
    buffers: &mut OutgoingBuffers,
) {
    let body = body.into();

    response.set_status(StatusCode::OK);
    response.version = request.version.clone();
    response.headers.push_back(CONTENT_LENGTH, body.len().to_string());

    *buffers = response.to_buffers();
    buffers.push(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_chunk_framing() {
        let mut buffers = OutgoingBuffers::new();
        write_chunk_prefix(0x1a2b, &mut buffers);
        buffers.push("data");
        write_chunk_suffix(&mut buffers);
        write_chunk_prefix(0, &mut buffers);

        assert_eq!(buffers.concat(), "1a2b\r\ndata\r\n0\r\n");
    }

    #[test]
    fn test_write_200_response() {
        let mut request = RequestPreBody::default();
        request.version = Bytes::from_static(b"HTTP/1.0");

        let mut response = ResponsePreBody::default();
        response.headers.push_back("Server", "micro-proxy");

        let mut buffers = OutgoingBuffers::new();
        buffers.push("dropped");
        write_200_response_with_length(&request, &mut response, "Hello", &mut buffers);

        let expected = indoc! {"
            HTTP/1.0 200 OK
            Server: micro-proxy
            Content-Length: 5

            Hello"}
        .replace('\n', "\r\n");

        assert_eq!(buffers.concat(), expected.as_str());
        assert_eq!(response.status(), Some(StatusCode::OK));
    }
}
