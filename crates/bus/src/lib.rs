//! Unbounded single-reader fanout for pipeline events.
//!
//! External subscribers (the session recorder, a UI, test harnesses) must
//! never be able to stall the pipeline's event-processing loop. Each
//! subscriber gets its own `UnboundedReceiver`; publishing clones the event
//! into every live subscriber's queue and never awaits. A subscriber that
//! falls behind only grows its own backlog.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// A fanout point for one event stream. Cloned on publish, so `T` should be
/// cheap to clone (the pipeline's DTOs are small structs/enums).
pub struct EventChannel<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber. Dead subscribers (dropped
    /// receivers) are pruned on the next publish.
    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber list poisoned").len()
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let channel: EventChannel<u32> = EventChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(7);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let channel: EventChannel<u32> = EventChannel::new();
        let dropped = channel.subscribe();
        let mut kept = channel.subscribe();
        drop(dropped);

        channel.publish(1);
        channel.publish(2);

        assert_eq!(kept.recv().await, Some(1));
        assert_eq!(kept.recv().await, Some(2));
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let channel: EventChannel<u32> = EventChannel::new();
        channel.publish(1);
        assert_eq!(channel.subscriber_count(), 0);
    }
}
