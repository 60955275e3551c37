use dashmap::DashMap;
use qconn_core::{Connection, ConnectionStats, RpcError};
use std::sync::Arc;
use uuid::Uuid;

/// Live connections of a node, keyed by connection id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Connection) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Connection> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: &Uuid) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .iter()
            .map(|entry| entry.value().stats())
            .collect()
    }

    /// Registers `connection` and drops it from the registry once it closes.
    pub fn track(&self, connection: Connection) {
        self.insert(connection.clone());
        let connections = self.connections.clone();
        tokio::spawn(async move {
            connection.closed().await;
            connections.remove(&connection.id());
        });
    }

    /// Closes every live connection with `reason`.
    pub fn close_all(&self, reason: Option<RpcError>) {
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.close(reason.clone());
            self.connections.remove(&connection.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qconn_core::{pair, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_track_removes_closed_connections() {
        let registry = ConnectionRegistry::new();
        let (a_end, b_end) = pair();
        let a = Connection::new(a_end, Value::Null);
        let _b = Connection::new(b_end, Value::Null);

        registry.track(a.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&a.id()).is_some());

        a.close(None);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (a_end, b_end) = pair();
            registry.insert(Connection::new(a_end, Value::Null));
            peers.push(Connection::new(b_end, Value::Null));
        }
        assert_eq!(registry.stats().len(), 3);

        registry.close_all(Some(RpcError::internal("shutdown")));
        assert!(registry.is_empty());
        for peer in peers {
            let reason = tokio::time::timeout(Duration::from_secs(1), peer.closed())
                .await
                .unwrap();
            assert_eq!(reason, Some(RpcError::internal("shutdown")));
        }
    }
}
