//! In-process delivery to live subscribers.
//!
//! One `tokio::sync::broadcast` channel per recipient, created on first
//! subscribe. Delivering to a recipient nobody is listening to is not an
//! error: the application row is the source of truth and the client
//! re-fetches when it reconnects.
use super::{Notification, NotificationSink, Recipient};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

pub struct NotificationHub {
    channels: RwLock<HashMap<Recipient, broadcast::Sender<Notification>>>,
    capacity: usize,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a user's private channel or a desk channel.
    pub async fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        if let Some(tx) = self.channels.read().await.get(&recipient) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop channels whose subscribers have all gone away.
    pub async fn prune(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    /// Number of live subscribers for `recipient`.
    pub async fn subscriber_count(&self, recipient: Recipient) -> usize {
        self.channels
            .read()
            .await
            .get(&recipient)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl NotificationSink for NotificationHub {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let recipient = notification.recipient();
        let channels = self.channels.read().await;
        let delivered = channels
            .get(&recipient)
            .map(|tx| tx.send(notification.clone()).unwrap_or(0))
            .unwrap_or(0);
        if delivered == 0 {
            debug!(?recipient, application_id = notification.application_id, "no live subscriber");
        }
        Ok(())
    }
}
