//! Subscription table and message fan-out.

use std::collections::HashMap;

use bytes::Bytes;
use mqtt_iot_exporter_core::DiagnosticSink;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A message queued for delivery to one session.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug)]
struct Subscriber {
    client_id: String,
    tx: mpsc::Sender<Outbound>,
    filters: Vec<String>,
}

/// Live sessions and the filters each one subscribed to.
#[derive(Debug, Default)]
pub struct Subscriptions {
    sessions: RwLock<HashMap<u64, Subscriber>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's delivery queue.
    pub fn register(&self, session_id: u64, client_id: &str, tx: mpsc::Sender<Outbound>) {
        self.sessions.write().insert(
            session_id,
            Subscriber {
                client_id: client_id.to_string(),
                tx,
                filters: Vec::new(),
            },
        );
    }

    /// Drop a session and all of its subscriptions.
    pub fn remove(&self, session_id: u64) {
        self.sessions.write().remove(&session_id);
    }

    /// Add a filter for a session. Subscribing twice to one filter is a no-op.
    pub fn subscribe(&self, session_id: u64, filter: &str) {
        let mut sessions = self.sessions.write();
        let Some(subscriber) = sessions.get_mut(&session_id) else {
            return;
        };
        if !subscriber.filters.iter().any(|f| f == filter) {
            subscriber.filters.push(filter.to_string());
        }
    }

    /// Remove a filter from a session. Returns whether it was subscribed.
    pub fn unsubscribe(&self, session_id: u64, filter: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(subscriber) = sessions.get_mut(&session_id) else {
            return false;
        };
        let before = subscriber.filters.len();
        subscriber.filters.retain(|f| f != filter);
        subscriber.filters.len() != before
    }

    /// Deliver a message to every session with a matching filter.
    ///
    /// Deliveries never block: a session whose queue is full misses the
    /// message. Returns the number of sessions the message was queued for.
    pub fn route(&self, topic: &str, payload: Bytes) -> usize {
        let sessions = self.sessions.read();
        let mut delivered = 0;

        for subscriber in sessions.values() {
            if !subscriber.filters.iter().any(|f| matches(topic, f)) {
                continue;
            }

            let message = Outbound {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match subscriber.tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        client_id = %subscriber.client_id,
                        topic = %topic,
                        "Outbound queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(client_id = %subscriber.client_id, "Session already closed");
                }
            }
        }

        trace!(topic = %topic, delivered, "Routed message");
        delivered
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl DiagnosticSink for Subscriptions {
    fn publish(&self, topic: &str, payload: Vec<u8>) {
        let delivered = self.route(topic, Bytes::from(payload));
        debug!(topic = %topic, delivered, "Published diagnostic");
    }
}

/// Match a concrete topic against a filter with `+` and `#` wildcards.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether a subscription filter is well formed.
///
/// `#` must be a whole level and the last one, `+` must be a whole level.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// Whether a publish topic is well formed (non-empty, no wildcards).
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        assert!(matches("device/d1/server_error", "device/d1/server_error"));
        assert!(matches("device/d1/server_error", "device/+/server_error"));
        assert!(matches("device/d1/server_error", "device/d1/#"));
        assert!(matches("device/d1", "device/d1/#"));
        assert!(matches("device/d1/metrics/m/push", "#"));

        assert!(!matches("device/d1/server_error", "device/d2/server_error"));
        assert!(!matches("device/d1/server_error", "device/+"));
        assert!(!matches("device/d1", "device/d1/server_error"));
    }

    #[test]
    fn test_valid_filter() {
        assert!(valid_filter("device/d1/#"));
        assert!(valid_filter("device/+/server_error"));
        assert!(valid_filter("#"));

        assert!(!valid_filter(""));
        assert!(!valid_filter("device/#/x"));
        assert!(!valid_filter("device/d1+"));
        assert!(!valid_filter("device/d#"));
    }

    #[test]
    fn test_valid_topic() {
        assert!(valid_topic("device/d1/metrics/m/push"));
        assert!(!valid_topic(""));
        assert!(!valid_topic("device/+/x"));
    }

    #[tokio::test]
    async fn test_route_to_matching_sessions() {
        let subs = Subscriptions::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        subs.register(1, "c1", tx1);
        subs.register(2, "c2", tx2);
        subs.subscribe(1, "device/d1/#");
        subs.subscribe(2, "device/d2/#");

        let delivered = subs.route("device/d1/server_error", Bytes::from_static(b"x"));
        assert_eq!(delivered, 1);

        let message = rx1.recv().await.unwrap();
        assert_eq!(message.topic, "device/d1/server_error");
        assert_eq!(&message.payload[..], b"x");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops() {
        let subs = Subscriptions::new();
        let (tx, _rx) = mpsc::channel(1);
        subs.register(1, "c1", tx);
        subs.subscribe(1, "#");

        assert_eq!(subs.route("a", Bytes::new()), 1);
        assert_eq!(subs.route("a", Bytes::new()), 0);
    }

    #[test]
    fn test_unsubscribe_and_remove() {
        let subs = Subscriptions::new();
        let (tx, _rx) = mpsc::channel(4);
        subs.register(7, "c7", tx);
        subs.subscribe(7, "a/b");
        subs.subscribe(7, "a/b");

        assert!(subs.unsubscribe(7, "a/b"));
        assert!(!subs.unsubscribe(7, "a/b"));
        assert_eq!(subs.route("a/b", Bytes::new()), 0);

        subs.remove(7);
        assert_eq!(subs.session_count(), 0);
    }

    #[test]
    fn test_diagnostic_sink_routes() {
        let subs = Subscriptions::new();
        let (tx, mut rx) = mpsc::channel(4);
        subs.register(1, "c1", tx);
        subs.subscribe(1, "device/d1/server_error");

        DiagnosticSink::publish(&subs, "device/d1/server_error", b"{}".to_vec());
        assert_eq!(rx.try_recv().unwrap().topic, "device/d1/server_error");
    }
}
