//! Change-event fan-out to dashboard clients
//!
//! Holds the live set of connected notification clients and delivers every
//! change event to all of them, at most once, best effort. No per-client
//! history: a reconnecting client sees only events emitted after it rejoined.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::watch::ChangeEvent;

/// Wire envelope pushed to dashboard sockets
#[derive(Serialize)]
struct Envelope<'a> {
    event: &'static str,
    data: &'a ChangeEvent,
}

/// Registry of connected dashboard clients
///
/// Membership changes only through [`register`](Self::register) and
/// [`unregister`](Self::unregister); the transport layer owns both calls.
#[derive(Default)]
pub struct EventBroadcaster {
    clients: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client, returning its id and its outbound message stream
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut clients = self.clients.write().await;
        clients.insert(id, tx);
        tracing::info!(client = %id, clients = clients.len(), "Dashboard client connected");

        (id, rx)
    }

    /// Remove a client; unknown ids are ignored
    pub async fn unregister(&self, id: &Uuid) {
        let mut clients = self.clients.write().await;
        if clients.remove(id).is_some() {
            tracing::info!(client = %id, clients = clients.len(), "Dashboard client disconnected");
        }
    }

    /// Deliver an event to every connected client
    ///
    /// Serializes once and walks the current membership snapshot. A client
    /// whose channel already closed is skipped; its removal belongs to the
    /// transport's disconnect handling. Returns the delivery count.
    pub async fn publish(&self, event: &ChangeEvent) -> usize {
        let envelope = Envelope {
            event: "dataChanged",
            data: event,
        };
        let message = match serde_json::to_string(&envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Change event failed to serialize");
                return 0;
            }
        };

        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (id, tx) in clients.iter() {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(client = %id, "Skipped client with closed channel");
            }
        }

        if delivered > 0 {
            tracing::debug!(entity = %event.entity, delivered, "Change event published");
        }
        delivered
    }

    /// Number of connected clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::watch::ChangeAction;

    use super::*;

    fn event() -> ChangeEvent {
        ChangeEvent {
            entity: "production_data".to_string(),
            action: ChangeAction::Insert,
            timestamp: Utc::now(),
            payload: Some(serde_json::json!({ "id": 42 })),
        }
    }

    #[tokio::test]
    async fn test_publish_with_no_clients_is_noop() {
        let hub = EventBroadcaster::new();
        assert_eq!(hub.publish(&event()).await, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_clients() {
        let hub = EventBroadcaster::new();
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;

        assert_eq!(hub.publish(&event()).await, 2);

        let msg_a = rx_a.recv().await.unwrap();
        let msg_b = rx_b.recv().await.unwrap();
        assert_eq!(msg_a, msg_b);

        let json: serde_json::Value = serde_json::from_str(&msg_a).unwrap();
        assert_eq!(json["event"], "dataChanged");
        assert_eq!(json["data"]["entity"], "production_data");
        assert_eq!(json["data"]["action"], "insert");
        assert_eq!(json["data"]["payload"]["id"], 42);
    }

    #[tokio::test]
    async fn test_dead_client_does_not_break_delivery() {
        let hub = EventBroadcaster::new();
        let (_a, mut rx_a) = hub.register().await;
        let (_b, rx_b) = hub.register().await;
        let (_c, mut rx_c) = hub.register().await;

        // One client's receiver is already gone
        drop(rx_b);

        assert_eq!(hub.publish(&event()).await, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unregister_shrinks_membership() {
        let hub = EventBroadcaster::new();
        let (id, _rx) = hub.register().await;
        assert_eq!(hub.client_count().await, 1);

        hub.unregister(&id).await;
        assert_eq!(hub.client_count().await, 0);

        // Unknown id is a no-op
        hub.unregister(&Uuid::new_v4()).await;
        assert_eq!(hub.client_count().await, 0);
    }
}
