//! Arguments handed to the checkpoint callbacks.
//!
//! Every params struct borrows the connection's own scratch objects. Whatever a
//! callback changes through them is what the connection sees when the checkpoint
//! completes; in particular the [`OutgoingBuffers`] left behind decide the next
//! action of the connection.

use bytes::Bytes;

use crate::callbacks::{ConnectionId, RequestId};
use crate::protocol::{BodyLength, OutgoingBuffers, RequestPreBody, ResponsePreBody, Trailer};

/// Arguments of [`ProxyCallbacks::on_connect_method`](crate::callbacks::ProxyCallbacks::on_connect_method).
#[derive(Debug)]
pub struct ConnectParams<'a> {
    pub connection_id: ConnectionId,
    /// Host part of the CONNECT target.
    pub host: &'a mut String,
    /// Port part of the CONNECT target.
    pub service: &'a mut String,
    pub request: &'a mut RequestPreBody,
}

/// Arguments of [`ProxyCallbacks::on_request_pre_body`](crate::callbacks::ProxyCallbacks::on_request_pre_body).
#[derive(Debug)]
pub struct RequestPreBodyParams<'a> {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
    /// True once the connection was bumped to TLS.
    pub ssl: bool,
    /// Upstream host. Changing it re-points the upstream connection of this request.
    pub host: &'a mut String,
    pub request: &'a mut RequestPreBody,
    pub response: &'a mut ResponsePreBody,
    /// Clear it to refuse the body of a request that expects `100 Continue`.
    pub expect_body_continue_from_downstream: &'a mut bool,
    /// Whether upstream is expected to answer with `100 Continue` first.
    pub expect_100_continue_from_upstream: &'a mut bool,
    pub request_trailer: &'a mut Trailer,
    pub response_trailer: &'a mut Trailer,
    pub request_body_length: BodyLength,
    pub downstream: &'a mut OutgoingBuffers,
    pub upstream: &'a mut OutgoingBuffers,
}

/// Arguments of [`ProxyCallbacks::on_request_body_some`](crate::callbacks::ProxyCallbacks::on_request_body_some).
#[derive(Debug)]
pub struct RequestBodyParams<'a> {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
    pub ssl: bool,
    pub host: &'a str,
    pub request: &'a mut RequestPreBody,
    pub response: &'a mut ResponsePreBody,
    pub expect_100_continue_from_upstream: &'a mut bool,
    pub request_trailer: &'a mut Trailer,
    pub response_trailer: &'a mut Trailer,
    /// False on the last call for this request.
    pub has_more: bool,
    /// The next piece of the body, still in its wire framing.
    pub body: Bytes,
    pub request_body_length: BodyLength,
    pub downstream: &'a mut OutgoingBuffers,
    pub upstream: &'a mut OutgoingBuffers,
}

/// Arguments of [`ProxyCallbacks::on_response_pre_body`](crate::callbacks::ProxyCallbacks::on_response_pre_body).
#[derive(Debug)]
pub struct ResponsePreBodyParams<'a> {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
    pub ssl: bool,
    pub host: &'a str,
    pub request: &'a mut RequestPreBody,
    /// The response, or the interim `100 Continue` response preceding it.
    pub response: &'a mut ResponsePreBody,
    pub expect_body_continue_from_downstream: &'a mut bool,
    /// True when the response cannot carry a body, whatever its headers say.
    pub body_forbidden: bool,
    pub response_body_length: BodyLength,
    pub downstream: &'a mut OutgoingBuffers,
}

/// Arguments of [`ProxyCallbacks::on_response_body_some`](crate::callbacks::ProxyCallbacks::on_response_body_some).
#[derive(Debug)]
pub struct ResponseBodyParams<'a> {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
    pub ssl: bool,
    pub host: &'a str,
    pub request: &'a mut RequestPreBody,
    pub response: &'a mut ResponsePreBody,
    pub response_trailer: &'a mut Trailer,
    pub body_forbidden: bool,
    /// False on the last call for this response.
    pub has_more: bool,
    pub body: Bytes,
    pub response_body_length: BodyLength,
    pub downstream: &'a mut OutgoingBuffers,
}
