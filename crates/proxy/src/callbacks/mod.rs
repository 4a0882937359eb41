//! The extension surface of the proxy.
//!
//! A [`ProxyCallbacks`] implementation is consulted at five checkpoints of every
//! request cycle:
//!
//! 1. [`on_connect_method`](ProxyCallbacks::on_connect_method): tunnel or bump a CONNECT
//! 2. [`on_request_pre_body`](ProxyCallbacks::on_request_pre_body): request line and headers
//! 3. [`on_request_body_some`](ProxyCallbacks::on_request_body_some): every piece of the request body
//! 4. [`on_response_pre_body`](ProxyCallbacks::on_response_pre_body): status line and headers
//! 5. [`on_response_body_some`](ProxyCallbacks::on_response_body_some): every piece of the response body
//!
//! A checkpoint completes when its future resolves; it may take as long as it needs.
//! Afterwards the connection looks at the [`OutgoingBuffers`] the callback left behind:
//! upstream buffers are written upstream, downstream buffers are written downstream,
//! and with nothing queued the connection reads on.
//!
//! The body checkpoints are called once more with `has_more == false` after the last
//! piece, and also exactly once for messages without a body. That last call is the
//! single place to flush a buffered or transformed body.
//!
//! Every method has a passthrough default, so an implementation overrides only what it
//! customizes. [`PassthroughCallbacks`] uses the defaults unchanged.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use micro_proxy::callbacks::{ProxyCallbacks, ResponsePreBodyParams};
//!
//! struct Tagging;
//!
//! #[async_trait]
//! impl ProxyCallbacks for Tagging {
//!     async fn on_response_pre_body(&self, params: &mut ResponsePreBodyParams<'_>) -> bool {
//!         params.response.headers.push_back("Via", "micro-proxy");
//!         *params.downstream = params.response.to_buffers();
//!         false
//!     }
//! }
//! ```

mod helpers;
mod params;

use async_trait::async_trait;

use crate::protocol::{BodyLength, OutgoingBuffers};

pub use helpers::{write_200_response_with_length, write_chunk_prefix, write_chunk_suffix};
pub use params::{ConnectParams, RequestBodyParams, RequestPreBodyParams, ResponseBodyParams, ResponsePreBodyParams};

/// Identifies a downstream connection, in accept order starting from 0.
pub type ConnectionId = u64;

/// Identifies a request cycle within its connection, starting from 0.
pub type RequestId = u64;

#[async_trait]
pub trait ProxyCallbacks: Send + Sync + 'static {
    /// Called once the listener is bound.
    fn on_ready(&self, _port: u16) {}

    /// Called for every accepted connection, before its first read.
    async fn on_connection(&self, _connection_id: ConnectionId) {}

    /// Decides what to do with a CONNECT request.
    ///
    /// # Returns
    /// `true` to bump the connection (terminate TLS locally and inspect the requests inside),
    /// `false` to tunnel raw bytes to `host:service`.
    async fn on_connect_method(&self, _params: &mut ConnectParams<'_>) -> bool {
        false
    }

    /// Called once the request line and headers were parsed.
    ///
    /// # Returns
    /// `true` to write the queued buffers before parsing any body bytes already received.
    async fn on_request_pre_body(&self, params: &mut RequestPreBodyParams<'_>) -> bool {
        *params.upstream = params.request.to_buffers();
        false
    }

    /// Called for every piece of the request body and once more at its end.
    async fn on_request_body_some(&self, params: &mut RequestBodyParams<'_>) {
        forward_body(
            params.upstream,
            &params.body,
            params.has_more,
            params.request_body_length,
            || params.request_trailer.to_buffers(),
        );
    }

    /// Called with the status line and headers of a response.
    ///
    /// An interim `100 Continue` response is delivered through its own call with
    /// `body_forbidden` set.
    ///
    /// # Returns
    /// `true` to write the queued buffers before parsing any body bytes already received.
    async fn on_response_pre_body(&self, params: &mut ResponsePreBodyParams<'_>) -> bool {
        *params.downstream = params.response.to_buffers();
        false
    }

    /// Called for every piece of the response body and once more at its end.
    async fn on_response_body_some(&self, params: &mut ResponseBodyParams<'_>) {
        forward_body(
            params.downstream,
            &params.body,
            params.has_more,
            params.response_body_length,
            || params.response_trailer.to_buffers(),
        );
    }

    /// Called exactly once per request cycle, whether it succeeded or not.
    async fn on_response_finished(&self, _connection_id: ConnectionId, _request_id: RequestId) {}

    /// Called exactly once when a connection is torn down.
    fn on_connection_finished(&self, _connection_id: ConnectionId) {}
}

/// Forwards every message untouched and tunnels every CONNECT.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCallbacks;

impl ProxyCallbacks for PassthroughCallbacks {}

fn forward_body(
    buffers: &mut OutgoingBuffers,
    body: &bytes::Bytes,
    has_more: bool,
    body_length: BodyLength,
    trailer: impl FnOnce() -> OutgoingBuffers,
) {
    buffers.push(body.clone());
    if !has_more && body_length == BodyLength::Chunked {
        buffers.append(&mut trailer());
    }
}
