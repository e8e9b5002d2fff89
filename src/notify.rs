//! Live fan-out of notification rows to the recipient's open streams.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::Notification;

pub const DEFAULT_BUFFER: usize = 64;

/// One broadcast channel per recipient, created on first subscribe and dropped
/// once a publish finds nobody listening.
#[derive(Clone)]
pub struct NotificationHub {
    channels: Arc<DashMap<Uuid, broadcast::Sender<Notification>>>,
    buffer: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Self {
        Self { channels: Arc::new(DashMap::new()), buffer: buffer.max(1) }
    }

    pub fn subscribe(&self, recipient: Uuid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Push a row to its recipient; returns how many streams received it.
    pub fn publish(&self, row: &Notification) -> usize {
        let recipient = row.recipient_user_id;
        let delivered = match self.channels.get(&recipient) {
            Some(tx) => tx.send(row.clone()).unwrap_or(0),
            None => {
                tracing::debug!(%recipient, "no live subscribers");
                return 0;
            }
        };
        if delivered == 0 {
            self.channels.remove_if(&recipient, |_, tx| tx.receiver_count() == 0);
        }
        tracing::debug!(%recipient, delivered, "notification published");
        delivered
    }

    pub fn subscriber_count(&self, recipient: Uuid) -> usize {
        self.channels.get(&recipient).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

/// Format a row as one server-sent event.
pub fn sse_frame(row: &Notification) -> Result<String, serde_json::Error> {
    Ok(format!("event: notification\nid: {}\ndata: {}\n\n", row.id, serde_json::to_string(row)?))
}
