//! Subscriber fan-out
//!
//! Holds the live client connections. Each subscriber is a bounded channel
//! drained by its transport task. A send that fails means the transport is
//! gone or has fallen a full queue behind, and the subscriber is pruned on
//! the spot; its transport then sees the channel close.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::engine::ServerMessage;

/// Messages a subscriber may have queued before it is dropped as stalled.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Where the engine publishes its records.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// Deliver one message; returns how many receivers took it.
    async fn publish(&self, message: &ServerMessage) -> usize;

    /// Release every receiver. Called once when the engine stops.
    async fn close(&self);
}

/// Opaque handle returned by [`SubscriberHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct SubscriberHub {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<String>>>,
    queue_depth: usize,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a subscriber. Messages arrive already serialized as JSON text.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId(Uuid::new_v4());
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.write().await.insert(id, tx);
        log::info!("Subscriber {} connected", id);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.write().await.remove(&id).is_some() {
            log::info!("Subscriber {} disconnected", id);
        }
    }

    /// Deliver `message` to every current subscriber, dropping the ones whose
    /// transport has gone away or stopped draining. Never waits on a slow
    /// subscriber. Returns how many deliveries succeeded.
    pub async fn broadcast<T: Serialize>(&self, message: &T) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let subscribers = self.subscribers.read().await;
            for (id, tx) in subscribers.iter() {
                match tx.try_send(text.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Subscriber {} is {} messages behind, dropping it",
                            id,
                            self.queue_depth
                        );
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
                log::debug!("Pruned closed subscriber {}", id);
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Drop every subscriber; their transports see the channel close.
    pub async fn close_all(&self) {
        let mut subscribers = self.subscribers.write().await;
        if !subscribers.is_empty() {
            log::info!("Closing {} subscriber connection(s)", subscribers.len());
        }
        subscribers.clear();
    }
}

#[async_trait]
impl UpdateSink for SubscriberHub {
    async fn publish(&self, message: &ServerMessage) -> usize {
        self.broadcast(message).await
    }

    async fn close(&self) {
        self.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let hub = SubscriberHub::new();
        let (_a, mut rx_a) = hub.subscribe().await;
        let (_b, mut rx_b) = hub.subscribe().await;

        assert_eq!(hub.broadcast(&json!({"n": 1})).await, 2);
        assert_eq!(rx_a.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(rx_b.recv().await.unwrap(), r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let hub = SubscriberHub::new();
        let (_a, mut rx_a) = hub.subscribe().await;
        let (_b, rx_b) = hub.subscribe().await;
        let (_c, mut rx_c) = hub.subscribe().await;
        drop(rx_b);

        assert_eq!(hub.broadcast(&json!("tick")).await, 2);
        assert_eq!(hub.subscriber_count().await, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close_all() {
        let hub = SubscriberHub::new();
        let (a, _rx_a) = hub.subscribe().await;
        let (_b, mut rx_b) = hub.subscribe().await;

        hub.unsubscribe(a).await;
        assert_eq!(hub.subscriber_count().await, 1);

        hub.close_all().await;
        assert_eq!(hub.subscriber_count().await, 0);
        assert!(rx_b.recv().await.is_none());
        assert_eq!(hub.broadcast(&json!(1)).await, 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_dropped() {
        let hub = SubscriberHub::with_queue_depth(4);
        let (_stalled, mut rx_stalled) = hub.subscribe().await;
        let (_live, mut rx_live) = hub.subscribe().await;

        for n in 0..4 {
            assert_eq!(hub.broadcast(&json!(n)).await, 2);
            assert_eq!(rx_live.recv().await.unwrap(), n.to_string());
        }

        // The fifth message finds the stalled queue full.
        assert_eq!(hub.broadcast(&json!(4)).await, 1);
        assert_eq!(hub.subscriber_count().await, 1);
        assert_eq!(rx_live.recv().await.unwrap(), "4");

        // What was queued before the drop is still readable, then the
        // channel reports closed.
        for n in 0..4 {
            assert_eq!(rx_stalled.recv().await.unwrap(), n.to_string());
        }
        assert!(rx_stalled.recv().await.is_none());
        assert_eq!(hub.broadcast(&json!(5)).await, 1);
    }
}
