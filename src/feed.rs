use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::database::StoredMessage;

/// One ordered snapshot of a conversation's message log, oldest first.
pub type MessageSnapshot = Arc<Vec<StoredMessage>>;

const FEED_CAPACITY: usize = 64;

/// Live subscription registry for conversation message logs.
///
/// Subscribers receive whole ordered snapshots, never diffed deltas; a
/// consumer that lags simply skips to the latest snapshot. Dropping the
/// receiver is the unsubscribe. Conversations are independent channels, so
/// activity in one never wakes subscribers of another.
pub struct MessageFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<MessageSnapshot>>>,
}

impl MessageFeed {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<MessageSnapshot> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }

    /// Publish the latest snapshot to whoever is watching this conversation.
    /// Channels with no remaining subscribers are pruned as a side effect.
    pub fn publish(&self, conversation_id: &str, messages: Vec<StoredMessage>) {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = channels.get(conversation_id) {
            if sender.send(Arc::new(messages)).is_err() {
                channels.remove(conversation_id);
            }
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl Default for MessageFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MessageRole;

    fn message(content: &str) -> StoredMessage {
        StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "conv-1".to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            created_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_ordered_snapshots() {
        let feed = MessageFeed::new();
        let mut rx = feed.subscribe("conv-1");

        feed.publish("conv-1", vec![message("hi")]);
        feed.publish("conv-1", vec![message("hi"), message("hello")]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].content, "hello");
    }

    #[tokio::test]
    async fn conversations_are_independent_channels() {
        let feed = MessageFeed::new();
        let mut rx_a = feed.subscribe("conv-a");
        let _rx_b = feed.subscribe("conv-b");

        feed.publish("conv-b", vec![message("elsewhere")]);
        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_prunes_the_channel() {
        let feed = MessageFeed::new();
        {
            let _rx = feed.subscribe("conv-1");
        }
        feed.publish("conv-1", vec![message("into the void")]);
        assert_eq!(feed.channel_count(), 0);

        // Publishing to a conversation nobody ever watched is a no-op.
        feed.publish("conv-2", vec![message("also fine")]);
    }
}
