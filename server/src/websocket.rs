//! Realtime connection registry for Callflow Server

use dashmap::DashMap;
use tokio::sync::mpsc;
use crate::models::WsServerMessage;

/// One authenticated realtime connection
#[derive(Clone)]
pub struct Connection {
    pub connection_id: String,
    pub sender: mpsc::UnboundedSender<WsServerMessage>,
}

/// Tracks which users are reachable and over which connections.
/// A user signed in on several clients has one entry per client.
pub struct WebSocketManager {
    /// Map of user_id -> Vec<Connection>
    connections: DashMap<String, Vec<Connection>>,
    /// Map of connection_id -> user_id for quick lookup
    connection_to_user: DashMap<String, String>,
}

impl WebSocketManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            connection_to_user: DashMap::new(),
        }
    }

    /// Register a new connection
    pub fn register(&self, user_id: &str, connection_id: &str, sender: mpsc::UnboundedSender<WsServerMessage>) {
        // Re-authenticating on the same socket moves it to the new user
        self.unregister(connection_id);

        let connection = Connection {
            connection_id: connection_id.to_string(),
            sender,
        };

        self.connections
            .entry(user_id.to_string())
            .or_insert_with(Vec::new)
            .push(connection);

        self.connection_to_user.insert(connection_id.to_string(), user_id.to_string());

        tracing::info!("Connection registered: user={}, connection={}", user_id, connection_id);
    }

    /// Unregister a connection
    pub fn unregister(&self, connection_id: &str) {
        if let Some((_, user_id)) = self.connection_to_user.remove(connection_id) {
            if let Some(mut connections) = self.connections.get_mut(&user_id) {
                connections.retain(|c| c.connection_id != connection_id);

                if connections.is_empty() {
                    drop(connections);
                    self.connections.remove_if(&user_id, |_, c| c.is_empty());
                }
            }

            tracing::info!("Connection unregistered: user={}, connection={}", user_id, connection_id);
        }
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).map(|c| !c.is_empty()).unwrap_or(false)
    }

    pub fn online_user_count(&self) -> usize {
        self.connections.len()
    }

    /// Send to every connection of a user. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: &str, message: WsServerMessage) -> usize {
        let mut delivered = 0;
        if let Some(connections) = self.connections.get(user_id) {
            for conn in connections.iter() {
                match conn.sender.send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::warn!("Failed to send to connection {}: {}", conn.connection_id, e)
                    }
                }
            }
        }
        delivered
    }
}

impl Default for WebSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_management() {
        let manager = WebSocketManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        manager.register("user1", "conn1", tx.clone());
        assert!(manager.is_user_online("user1"));
        assert!(!manager.is_user_online("user2"));

        // Second client for the same user
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.register("user1", "conn2", tx2);
        assert_eq!(manager.online_user_count(), 1);
        assert_eq!(manager.send_to_user("user1", WsServerMessage::Pong), 2);

        manager.unregister("conn1");
        assert!(manager.is_user_online("user1"));
        assert_eq!(manager.send_to_user("user1", WsServerMessage::Pong), 1);

        manager.unregister("conn2");
        assert!(!manager.is_user_online("user1"));
        assert_eq!(manager.send_to_user("user1", WsServerMessage::Pong), 0);
    }

    #[test]
    fn test_reauthentication_moves_connection() {
        let manager = WebSocketManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        manager.register("user1", "conn1", tx.clone());
        manager.register("user2", "conn1", tx);

        assert!(!manager.is_user_online("user1"));
        assert!(manager.is_user_online("user2"));
    }

    #[test]
    fn test_closed_receiver_is_not_counted() {
        let manager = WebSocketManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register("user1", "conn1", tx);
        drop(rx);

        assert_eq!(manager.send_to_user("user1", WsServerMessage::Pong), 0);
    }
}
