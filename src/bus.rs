use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-subscriber mailbox depth. Subscribers must drain promptly; a full
/// mailbox loses that subscriber's copy of the height, and the retry driver
/// reconciles from the cursor.
const MAILBOX_CAPACITY: usize = 10;

/// In-process height fan-out.
///
/// Subscriptions are static: every listener subscribes at startup and there is
/// no unsubscribe. Publishing never blocks the follower.
pub struct EventBus {
    topics: Mutex<HashMap<&'static str, Vec<mpsc::Sender<u64>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: &'static str) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .entry(topic)
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `height` to every subscriber of `topic`, dropping the copy for
    /// any subscriber whose mailbox is full.
    pub fn publish(&self, topic: &'static str, height: u64) {
        let topics = self.topics.lock().expect("bus lock poisoned");
        let Some(subs) = topics.get(topic) else {
            return;
        };
        for sub in subs {
            if let Err(err) = sub.try_send(height) {
                tracing::warn!(topic, height, error = %err, "subscriber mailbox full; dropping height");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        bus.publish("t", 7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn publish_to_full_mailbox_does_not_block() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("t");
        for h in 0..(MAILBOX_CAPACITY as u64 + 5) {
            bus.publish("t", h);
        }
        // the first ten heights survive, the overflow is dropped
        for h in 0..MAILBOX_CAPACITY as u64 {
            assert_eq!(rx.recv().await, Some(h));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish("t", 1);
    }
}
