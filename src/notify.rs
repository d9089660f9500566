//! Server notification dispatch
//!
//! Server-to-client messages without an `id` are fanned out to subscribers
//! keyed by method name (`notifications/progress`,
//! `notifications/resources/updated`, ...). Delivery is best-effort and
//! ordered per method. Each method has a bounded queue; when a subscriber
//! falls behind, the oldest undelivered notifications are dropped and the
//! lag is surfaced as a warning. Dispatch never blocks the reader task.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Depth of each per-method notification queue.
const NOTIFICATION_QUEUE_DEPTH: usize = 100;

/// One server notification as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Notification method name.
    pub method: String,
    /// Raw params value (`Value::Null` when absent).
    pub params: serde_json::Value,
}

/// A subscription to one notification method.
///
/// Obtained from [`NotificationDispatcher::subscribe`]. Dropping the
/// stream ends the subscription.
#[derive(Debug)]
pub struct NotificationStream {
    method: String,
    rx: broadcast::Receiver<Notification>,
}

impl NotificationStream {
    /// Receive the next notification, in per-method order.
    ///
    /// Returns `None` when the dispatcher has been dropped and the queue is
    /// drained. Notifications dropped under overflow are skipped with a
    /// diagnostic.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        "subscriber for {} lagged; dropped {n} oldest notifications",
                        self.method
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when the queue
    /// is currently empty or closed.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        "subscriber for {} lagged; dropped {n} oldest notifications",
                        self.method
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

/// Routes server notifications to per-method subscriber queues.
#[derive(Debug, Default)]
pub struct NotificationDispatcher {
    /// Lock discipline: held only to look up or create a channel, never
    /// while delivering.
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
}

impl NotificationDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a notification method.
    ///
    /// Multiple subscribers per method each see every notification, in
    /// order. Subscriptions made after a notification was dispatched do not
    /// see it.
    pub fn subscribe(&self, method: impl Into<String>) -> NotificationStream {
        let method = method.into();
        let rx = {
            let mut channels = self.channels.lock().expect("dispatcher lock poisoned");
            channels
                .entry(method.clone())
                .or_insert_with(|| broadcast::channel(NOTIFICATION_QUEUE_DEPTH).0)
                .subscribe()
        };
        NotificationStream { method, rx }
    }

    /// Deliver one notification to its method's subscribers.
    ///
    /// Methods nobody subscribed to are logged at debug and dropped. This
    /// never blocks: a full queue evicts its oldest entry.
    pub fn dispatch(&self, method: &str, params: serde_json::Value) {
        let sender = {
            let channels = self.channels.lock().expect("dispatcher lock poisoned");
            channels.get(method).cloned()
        };

        match sender {
            Some(sender) => {
                // Errors only mean every subscriber is gone; the
                // notification is then dropped like an unknown method.
                let _ = sender.send(Notification {
                    method: method.to_string(),
                    params,
                });
            }
            None => {
                tracing::debug!("no subscriber for notification '{method}'; dropping");
            }
        }
    }
}
