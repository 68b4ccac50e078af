use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::diff::NewEntryEvent;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPayload {
    pub title: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub body: EntryPayload,
}

/// Topic bus for new-entry notifications.
///
/// Publishing is fire-and-forget: with no subscribers the message is dropped, and
/// subscribers that fall behind by more than the bus capacity lose the oldest messages.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Message>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, topic: impl Into<String>, payload: EntryPayload) {
        let message = Message {
            topic: topic.into(),
            body: payload,
        };
        trace!(topic = %message.topic, "Publishing message");
        let _ = self.sender.send(message);
    }

    pub fn publish_entry(&self, event: &NewEntryEvent) {
        self.publish(
            event.topic.clone(),
            EntryPayload {
                title: event.title.clone(),
                link: event.link.clone(),
            },
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(title: &str) -> EntryPayload {
        EntryPayload {
            title: title.to_string(),
            link: format!("https://example.com/{}", title),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish("feed.https://example.com/rss", payload("A"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish("feed.a", payload("A"));
        bus.publish_entry(&NewEntryEvent {
            topic: "feed.b".to_string(),
            title: "B".to_string(),
            link: "https://example.com/B".to_string(),
        });

        for rx in [&mut first, &mut second] {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.topic, "feed.a");
            assert_eq!(message.body, payload("A"));

            let message = rx.recv().await.unwrap();
            assert_eq!(message.topic, "feed.b");
            assert_eq!(message.body.title, "B");
        }
    }

    #[test]
    fn test_slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        for title in ["A", "B", "C"] {
            bus.publish("feed.a", payload(title));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert_eq!(rx.try_recv().unwrap().body.title, "B");
    }
}
