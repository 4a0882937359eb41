//! An asynchronous intercepting HTTP/HTTPS forward proxy engine
//!
//! This crate accepts client connections, parses HTTP/1.x traffic incrementally,
//! forwards it to origin servers and lets an embedder inspect and rewrite every
//! message on the way through.
//!
//! # Features
//!
//! - Full HTTP/1.0 and HTTP/1.1 forward proxying with keep-alive
//! - Incremental parsers that accept input split at any byte
//! - Chunked transfer-coding including trailers
//! - `Expect: 100-continue` handling in both directions
//! - CONNECT as an opaque tunnel, or bumped into TLS interception
//! - Per-host leaf certificates issued by a local CA and cached
//! - Five async callback checkpoints with passthrough defaults
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use micro_proxy::callbacks::PassthroughCallbacks;
//! use micro_proxy::config::ProxyConfig;
//! use micro_proxy::server::ProxyServer;
//! use tracing::Level;
//! use tracing_subscriber::FmtSubscriber;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber)?;
//!
//!     let config = ProxyConfig::builder().address("127.0.0.1").port(3128).build()?;
//!     let server = ProxyServer::bind(config, Arc::new(PassthroughCallbacks)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`protocol`]: Header multi-map, pre-body models, body-length detection and stock replies
//! - [`codec`]: Incremental request, response and chunk parsers
//! - [`callbacks`]: The [`ProxyCallbacks`](callbacks::ProxyCallbacks) extension trait and its parameters
//! - [`connection`]: The per-connection state machine and the connection manager
//! - [`cert`]: Certificate authority and the per-host certificate cache
//! - [`config`]: Proxy configuration
//! - [`server`]: The accept loop and shutdown handling
//! - [`utils`]: Byte classes and URL helpers
//!
//! # Request cycle
//!
//! Each connection handles one request at a time:
//!
//! 1. Read and parse the request line and headers
//! 2. Consult the callbacks, then forward the request or answer it locally
//! 3. Stream the request body through the callbacks
//! 4. Parse the response pre-body and stream the response body back
//! 5. Keep the connection open, or close it as the messages demand
//!
//! A CONNECT request instead ends in a byte tunnel, or in a TLS handshake
//! with the client after which the cycle above runs over the decrypted stream.

pub mod callbacks;
pub mod cert;
pub mod codec;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod utils;
