//! Connection registry keyed by device id.
//!
//! Several drivers often share one physical line (a reference meter and a
//! source behind the same multiplexer, several ZIF sockets on one bus). The
//! registry makes sure every id maps to exactly one [`SerialPortConnection`]
//! and therefore to exactly one worker.

use crate::config::PortConfig;
use crate::connection::SerialPortConnection;
use crate::error::ConfigError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared connection handle.
pub type SharedConnection = Arc<SerialPortConnection>;

/// Owned map of open connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, SharedConnection>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing connection for `id`.
    pub fn get(&self, id: &str) -> Option<SharedConnection> {
        self.connections.read().get(id).cloned()
    }

    /// Existing connection for `id`, or open one from `config`.
    ///
    /// A connection that has been shut down is replaced.
    pub fn get_or_open(&self, id: &str, config: &PortConfig) -> Result<SharedConnection, ConfigError> {
        if let Some(existing) = self.get(id).filter(|c| !c.is_closed()) {
            tracing::debug!(device = id, "Reusing open connection");
            return Ok(existing);
        }

        let mut connections = self.connections.write();
        // another caller may have opened it while we waited for the lock
        if let Some(existing) = connections.get(id).filter(|c| !c.is_closed()) {
            return Ok(Arc::clone(existing));
        }
        let connection = Arc::new(SerialPortConnection::open(id, config)?);
        connections.insert(id.to_string(), Arc::clone(&connection));
        tracing::info!(device = id, endpoint = %connection.endpoint(), "Registered connection");
        Ok(connection)
    }

    /// Register an already opened connection, replacing any previous one.
    pub fn insert(&self, id: impl Into<String>, connection: SharedConnection) -> Option<SharedConnection> {
        let id = id.into();
        tracing::info!(device = %id, "Registered connection");
        self.connections.write().insert(id, connection)
    }

    /// Remove a connection. It closes once the last handle is dropped.
    pub fn remove(&self, id: &str) -> Option<SharedConnection> {
        let removed = self.connections.write().remove(id);
        if removed.is_some() {
            tracing::info!(device = id, "Removed connection from registry");
        }
        removed
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shut down and forget every connection.
    pub async fn close_all(&self) {
        let connections: Vec<(String, SharedConnection)> = self.connections.write().drain().collect();
        let count = connections.len();
        for (id, connection) in connections {
            tracing::debug!(device = %id, "Closing connection");
            connection.shutdown().await;
        }
        tracing::info!(count, "Closed all connections");
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_id_reuses_connection() {
        let registry = ConnectionRegistry::new();
        let config = PortConfig::mock("echo");

        let first = registry.get_or_open("bench", &config).unwrap();
        let second = registry.get_or_open("bench", &config).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let registry = ConnectionRegistry::new();
        let config = PortConfig::mock("echo");

        let first = registry.get_or_open("bench", &config).unwrap();
        first.shutdown().await;
        let second = registry.get_or_open("bench", &config).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }

    #[test]
    fn test_open_failure_is_not_registered() {
        let registry = ConnectionRegistry::new();
        assert!(registry.get_or_open("x", &PortConfig::mock("bogus")).is_err());
        assert!(registry.get("x").is_none());
        assert_eq!(registry.ids(), Vec::<String>::new());
    }
}
