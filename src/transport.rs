use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::TransportError;
use crate::messages::{ClientEvent, ServerEvent};

/// Everything a subscriber can observe from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Server(ServerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// A bidirectional, named-event channel to the chat server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues an event for delivery. Never waits on the network.
    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError>;

    async fn subscribe(&self) -> Subscription;

    async fn unsubscribe(&self, id: SubscriptionId);

    fn is_connected(&self) -> bool;
}

/// Ordered fan-out of transport events to live subscriptions.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<RwLock<Vec<(SubscriptionId, mpsc::UnboundedSender<TransportEvent>)>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self) -> Subscription {
        self.add_with(|| None).await
    }

    /// Registers a subscriber whose first event is `initial`, evaluated under
    /// the same lock `dispatch` takes so nothing can slip in between.
    pub async fn add_with<F>(&self, initial: F) -> Subscription
    where
        F: FnOnce() -> Option<TransportEvent>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();
        let mut subscribers = self.inner.write().await;
        if let Some(event) = initial() {
            let _ = tx.send(event);
        }
        subscribers.push((id, tx));
        Subscription { id, events: rx }
    }

    pub async fn remove(&self, id: SubscriptionId) {
        self.inner.write().await.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Delivers to every subscriber in registration order, pruning dropped ones.
    pub async fn dispatch(&self, event: &TransportEvent) {
        let mut subscribers = self.inner.write().await;
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    /// In-memory transport that records emits and lets tests inject events.
    #[derive(Clone, Default)]
    pub struct FakeTransport {
        sent: Arc<Mutex<Vec<ClientEvent>>>,
        subscribers: Subscribers,
        connected: Arc<AtomicBool>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn sent(&self) -> Vec<ClientEvent> {
            self.sent.lock().await.clone()
        }

        pub async fn clear_sent(&self) {
            self.sent.lock().await.clear();
        }

        pub async fn push(&self, event: TransportEvent) {
            match event {
                TransportEvent::Connected => self.connected.store(true, Ordering::SeqCst),
                TransportEvent::Disconnected { .. } => self.connected.store(false, Ordering::SeqCst),
                TransportEvent::Server(_) => {}
            }
            self.subscribers.dispatch(&event).await;
        }

        pub async fn push_server(&self, event: ServerEvent) {
            self.push(TransportEvent::Server(event)).await;
        }

        pub async fn subscriber_count(&self) -> usize {
            self.subscribers.len().await
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
            self.sent.lock().await.push(event);
            Ok(())
        }

        async fn subscribe(&self) -> Subscription {
            self.subscribers.add().await
        }

        async fn unsubscribe(&self, id: SubscriptionId) {
            self.subscribers.remove(id).await;
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_reaches_subscribers_in_order() {
        let subscribers = Subscribers::new();
        let mut first = subscribers.add().await;
        let mut second = subscribers.add().await;

        subscribers.dispatch(&TransportEvent::Connected).await;

        assert_eq!(first.events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(second.events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn primed_subscriber_sees_initial_event_first() {
        let subscribers = Subscribers::new();
        let mut plain = subscribers.add().await;
        let mut primed = subscribers
            .add_with(|| {
                Some(TransportEvent::Disconnected {
                    reason: "offline".to_string(),
                })
            })
            .await;

        subscribers.dispatch(&TransportEvent::Connected).await;

        assert_eq!(plain.events.recv().await, Some(TransportEvent::Connected));
        assert!(matches!(
            primed.events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert_eq!(primed.events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn removed_and_dropped_subscribers_stop_receiving() {
        let subscribers = Subscribers::new();
        let kept = subscribers.add().await;
        let removed = subscribers.add().await;
        let dropped = subscribers.add().await;

        subscribers.remove(removed.id).await;
        drop(dropped);
        subscribers.dispatch(&TransportEvent::Connected).await;

        assert_eq!(subscribers.len().await, 1);
        drop(kept);
        subscribers.dispatch(&TransportEvent::Connected).await;
        assert!(subscribers.is_empty().await);
    }
}
