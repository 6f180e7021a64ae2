use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::Message;

/// Pushed to every subscriber of `message.receiver_id` after an append.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InsertEvent {
    pub message: Message,
}

/// Per-connection lifecycle of a push subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Subscribed,
    Delivering,
}

type SubscriberMap = HashMap<Uuid, Vec<(u64, mpsc::Sender<InsertEvent>)>>;

/// Best-effort push feed of inserted messages, fanned out by receiver.
///
/// Events for one receiver reach each of its connections in publish order.
/// A subscriber whose buffer is full or whose receiver is gone is dropped;
/// it will notice the closed channel and fall back to polling.
#[derive(Clone)]
pub struct DeliveryHub {
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl DeliveryHub {
    pub fn new(buffer: usize) -> Self {
        DeliveryHub {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Registers a new connection for `user_id`. Connections whose
    /// `Subscription` was dropped without unsubscribing are pruned here.
    pub async fn subscribe(&self, user_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|_, targets| {
            targets.retain(|(_, tx)| !tx.is_closed());
            !targets.is_empty()
        });
        subscribers.entry(user_id).or_default().push((id, tx));
        drop(subscribers);
        debug!("Subscriber {} registered for {}", id, user_id);
        Subscription {
            id,
            user_id,
            rx,
            state: ConnectionState::Subscribed,
            hub: self.clone(),
        }
    }

    /// Fans `message` out to the subscribers of its receiver. Returns the
    /// number of connections it was handed to.
    pub async fn publish(&self, message: &Message) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let Some(targets) = subscribers.get_mut(&message.receiver_id) else {
            return 0;
        };

        let event = InsertEvent {
            message: message.clone(),
        };
        let mut delivered = 0;
        targets.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Subscriber {} for {} is lagging; dropping it",
                    id, message.receiver_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if targets.is_empty() {
            subscribers.remove(&message.receiver_id);
        }
        delivered
    }

    pub async fn subscriber_count(&self, user_id: &Uuid) -> usize {
        self.subscribers
            .lock()
            .await
            .get(user_id)
            .map(|targets| targets.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    async fn remove(&self, user_id: &Uuid, subscriber: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(targets) = subscribers.get_mut(user_id) {
            targets.retain(|(id, _)| *id != subscriber);
            if targets.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }
}

/// One connection's view of the push feed.
pub struct Subscription {
    id: u64,
    user_id: Uuid,
    rx: mpsc::Receiver<InsertEvent>,
    state: ConnectionState,
    hub: DeliveryHub,
}

impl Subscription {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Waits for the next event. Calling again marks the previous event as
    /// handled. A closed feed moves the subscription to `Disconnected`.
    pub async fn recv(&mut self) -> ChatResult<InsertEvent> {
        if self.state == ConnectionState::Disconnected {
            return Err(ChatError::DeliveryChannel("subscription closed".into()));
        }
        self.state = ConnectionState::Subscribed;
        match self.rx.recv().await {
            Some(event) => {
                self.state = ConnectionState::Delivering;
                Ok(event)
            }
            None => {
                self.state = ConnectionState::Disconnected;
                Err(ChatError::DeliveryChannel(format!(
                    "feed for {} dropped",
                    self.user_id
                )))
            }
        }
    }

    pub async fn unsubscribe(mut self) {
        self.state = ConnectionState::Disconnected;
        self.rx.close();
        self.hub.remove(&self.user_id, self.id).await;
        debug!("Subscriber {} for {} removed", self.id, self.user_id);
    }
}
