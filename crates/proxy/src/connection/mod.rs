//! Proxied connections and their registry.
//!
//! Each accepted socket becomes a [`Connection`] run by the [`ConnectionManager`] as
//! its own task. A connection is a strictly sequential state machine: it is only ever
//! waiting on one socket operation, one DNS lookup, one TLS handshake or one callback.
//! Opaque CONNECT tunnels are the exception and pump both directions at once.
//!
//! Transport and parse failures are handled inside the connection and end it. They
//! surface as a stock `400` or `502` reply where a reply is still possible, and as a
//! [`ConnectionError`] in the logs.

mod error;
mod manager;
mod proxy_connection;
mod state;
mod stream;

pub use error::ConnectionError;
pub use manager::ConnectionManager;
pub use state::{BumpState, ConnectionState, MessageState};
pub use stream::ProxyStream;

pub(crate) use proxy_connection::{Connection, ConnectionContext};
