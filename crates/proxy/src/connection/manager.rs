use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::callbacks::ConnectionId;
use crate::connection::Connection;

/// Registry of the live connections of a server.
///
/// Every started connection runs as its own task. Stopping a connection cancels
/// its pending socket operations; the connection then finishes any callback in
/// flight, notifies the callbacks and closes its sockets on its own.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, CancellationToken>>,
    tracker: TaskTracker,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start(self: &Arc<Self>, connection: Connection) {
        let id = connection.id();
        self.lock().insert(id, connection.token().clone());

        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            connection.run().await;
            manager.lock().remove(&id);
        });
        debug!(connection_id = id, "connection started");
    }

    /// Asks connection `id` to wind down.
    ///
    /// # Returns
    /// `false` if the connection was already stopped or never started.
    pub fn stop(&self, id: ConnectionId) -> bool {
        let Some(token) = self.lock().remove(&id) else {
            return false;
        };
        token.cancel();
        debug!(connection_id = id, "connection stop requested");
        true
    }

    /// Asks every registered connection to wind down.
    pub fn stop_all(&self) {
        let tokens: Vec<_> = self.lock().drain().collect();
        info!(connections = tokens.len(), "stopping all connections");
        for (_, token) in tokens {
            token.cancel();
        }
    }

    /// Resolves once every started connection finished its teardown.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, CancellationToken>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
