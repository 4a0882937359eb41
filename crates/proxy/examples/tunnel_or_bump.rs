use std::sync::Arc;

use async_trait::async_trait;
use micro_proxy::callbacks::{
    ConnectParams, ConnectionId, PassthroughCallbacks, ProxyCallbacks, RequestBodyParams, RequestId,
    RequestPreBodyParams, ResponseBodyParams, ResponsePreBodyParams, write_200_response_with_length,
};
use micro_proxy::config::ProxyConfig;
use micro_proxy::server::ProxyServer;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Logs every checkpoint and otherwise behaves like [`PassthroughCallbacks`].
struct Verbose {
    bump: bool,
}

#[async_trait]
impl ProxyCallbacks for Verbose {
    fn on_ready(&self, port: u16) {
        info!(port, "ready");
    }

    async fn on_connection(&self, connection_id: ConnectionId) {
        info!(connection_id, "connection");
    }

    async fn on_connect_method(&self, params: &mut ConnectParams<'_>) -> bool {
        info!(connection_id = params.connection_id, host = %params.host, service = %params.service, bump = self.bump, "CONNECT");
        self.bump
    }

    async fn on_request_pre_body(&self, params: &mut RequestPreBodyParams<'_>) -> bool {
        info!(
            connection_id = params.connection_id,
            request_id = params.request_id,
            ssl = params.ssl,
            host = %params.host,
            method = %String::from_utf8_lossy(&params.request.method),
            uri = %String::from_utf8_lossy(&params.request.uri),
            "request"
        );
        if params.request.uri == "/def/" {
            write_200_response_with_length(params.request, params.response, "Hello from micro-proxy\n", params.downstream);
            return false;
        }
        PassthroughCallbacks.on_request_pre_body(params).await
    }

    async fn on_request_body_some(&self, params: &mut RequestBodyParams<'_>) {
        info!(connection_id = params.connection_id, request_id = params.request_id, len = params.body.len(), has_more = params.has_more, "request body");
        PassthroughCallbacks.on_request_body_some(params).await;
    }

    async fn on_response_pre_body(&self, params: &mut ResponsePreBodyParams<'_>) -> bool {
        info!(
            connection_id = params.connection_id,
            request_id = params.request_id,
            status = %String::from_utf8_lossy(&params.response.code),
            body_forbidden = params.body_forbidden,
            "response"
        );
        PassthroughCallbacks.on_response_pre_body(params).await
    }

    async fn on_response_body_some(&self, params: &mut ResponseBodyParams<'_>) {
        info!(connection_id = params.connection_id, request_id = params.request_id, len = params.body.len(), has_more = params.has_more, "response body");
        PassthroughCallbacks.on_response_body_some(params).await;
    }

    async fn on_response_finished(&self, connection_id: ConnectionId, request_id: RequestId) {
        info!(connection_id, request_id, "response finished");
    }

    fn on_connection_finished(&self, connection_id: ConnectionId) {
        info!(connection_id, "connection finished");
    }
}

// cargo run --example tunnel_or_bump -- 127.0.0.1 3128 bump
// curl -v --cacert ca.pem -x http://127.0.0.1:3128 https://example.com/
#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = args.next().map_or(3128, |port| port.parse().expect("port should be a number"));
    let bump = match args.next().as_deref() {
        None | Some("tunnel") => false,
        Some("bump") => true,
        Some(other) => panic!("expected tunnel or bump, got {other}"),
    };

    let config = ProxyConfig::builder().address(address).port(port).build().unwrap();
    let server = ProxyServer::bind(config, Arc::new(Verbose { bump })).await.unwrap();
    server.run().await.unwrap();
}
