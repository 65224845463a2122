//! Outbound notification sink for health and critical-alert events.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;
const MAX_HISTORY_PER_EVENT: usize = 100;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event_type: &str, payload: Value);
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

/// Fans events out to any subscriber and keeps a bounded history per event
/// type for late consumers.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Notification>,
    history: Arc<DashMap<String, VecDeque<Notification>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            history: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn recent(&self, event_type: &str, since: i64) -> Vec<Notification> {
        self.history
            .get(event_type)
            .map(|q| q.iter().filter(|n| n.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for EventBroadcaster {
    fn notify(&self, event_type: &str, payload: Value) {
        let notification = Notification {
            event_type: event_type.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        {
            let mut entry = self.history.entry(event_type.to_string()).or_default();
            entry.push_back(notification.clone());
            if entry.len() > MAX_HISTORY_PER_EVENT {
                entry.pop_front();
            }
        }

        tracing::debug!(event = %event_type, "Notification emitted");
        // No subscribers is not an error
        let _ = self.tx.send(notification);
    }
}
