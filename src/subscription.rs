use crate::error::{ClockError, Result};
use crate::protocol::{topic_matches, Notification};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 100;

/// Receiver for broker notifications
pub struct NotificationReceiver {
    rx: broadcast::Receiver<Notification>,
}

impl NotificationReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<Notification>) -> Self {
        Self { rx }
    }

    /// Receive the next notification
    ///
    /// Fails with `ChannelError` once the channel is gone or this receiver lagged.
    pub async fn recv(&mut self) -> Result<Notification> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => {
                ClockError::ChannelError("Notification channel closed".to_string())
            }
            broadcast::error::RecvError::Lagged(n) => {
                ClockError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive a notification without blocking
    ///
    /// Returns `None` if no message is available.
    pub fn try_recv(&mut self) -> Result<Option<Notification>> {
        match self.rx.try_recv() {
            Ok(notification) => Ok(Some(notification)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => {
                Err(ClockError::ChannelError("Notification channel closed".to_string()))
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(ClockError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

/// Fans decoded broker messages out to a generic stream and to per-filter streams
pub(crate) struct Dispatcher {
    all_tx: broadcast::Sender<Notification>,
    routes: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (all_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            all_tx,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Every notification, regardless of topic
    pub fn subscribe_all(&self) -> NotificationReceiver {
        NotificationReceiver::new(self.all_tx.subscribe())
    }

    /// Notifications whose topic matches the MQTT `filter`
    pub fn subscribe_filter(&self, filter: &str) -> NotificationReceiver {
        let mut routes = self.routes();
        let tx = routes
            .entry(filter.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        NotificationReceiver::new(tx.subscribe())
    }

    /// Decode and fan out one raw message; returns false if it was dropped
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(notification) = Notification::decode(topic, payload) else {
            return false;
        };
        tracing::debug!("Received from {}: {}", topic, notification.data);

        let mut routes = self.routes();
        routes.retain(|_, tx| tx.receiver_count() > 0);
        for (filter, tx) in routes.iter() {
            if topic_matches(filter, topic) {
                let _ = tx.send(notification.clone());
            }
        }
        drop(routes);

        let _ = self.all_tx.send(notification);
        true
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Notification>>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}
