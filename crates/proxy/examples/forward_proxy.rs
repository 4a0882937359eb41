use std::sync::Arc;

use micro_proxy::callbacks::PassthroughCallbacks;
use micro_proxy::config::ProxyConfig;
use micro_proxy::server::ProxyServer;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

// cargo run --example forward_proxy -- 127.0.0.1 3128
// curl -v -x http://127.0.0.1:3128 http://example.com/
#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = args.next().map_or(3128, |port| port.parse().expect("port should be a number"));

    let config = ProxyConfig::builder().address(address).port(port).build().unwrap();
    let server = ProxyServer::bind(config, Arc::new(PassthroughCallbacks)).await.unwrap();
    server.run().await.unwrap();
}
