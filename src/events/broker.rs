//! Broker seam for distributed event delivery.
//!
//! The distributed stream publishes events to one topic per subscriber
//! category and consumes them through shared consumer groups. [`Broker`]
//! abstracts the transport so deployments can plug in a real message bus
//! while tests (and single-node deployments) run on [`InMemoryBroker`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{LoomError, Result};
use crate::events::stream::SubscriberKind;

/// Topic carrying events for one subscriber category:
/// `{topic_prefix}.events.{category}`.
pub fn topic_for(topic_prefix: &str, kind: SubscriberKind) -> String {
    format!("{}.events.{}", topic_prefix, kind)
}

/// Consumer group shared by every node's consumer for one category:
/// `{consumer_group_prefix}.{category}`.
pub fn group_for(consumer_group_prefix: &str, kind: SubscriberKind) -> String {
    format!("{}.{}", consumer_group_prefix, kind)
}

/// A message as seen by a consumer.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Partition key the producer supplied (the session id), which keeps one
    /// conversation's events ordered relative to each other.
    pub key: String,
    /// Serialized event record.
    pub payload: String,
}

/// Receiving half of a consumer-group subscription.
pub type BrokerReceiver = mpsc::UnboundedReceiver<BrokerMessage>;

/// Transport for cross-node event delivery.
///
/// Semantics expected of implementations: every consumer group subscribed to
/// a topic receives each published message exactly once, delivered to one
/// member of the group; messages sharing a key are delivered in publish order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` to `topic`, partitioned by `key`.
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<()>;

    /// Join `group` on `topic` and receive its share of messages.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<BrokerReceiver>;
}

struct GroupMembers {
    senders: Vec<mpsc::UnboundedSender<BrokerMessage>>,
    next: AtomicUsize,
}

/// Process-local [`Broker`] built on tokio channels.
///
/// Messages published to a topic with no subscribed groups are dropped; there
/// is no retention. Within a group, delivery round-robins across members.
///
/// # Example
/// ```
/// use eventloom::events::{Broker, InMemoryBroker};
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let mut rx = broker.subscribe("loom.events.server", "loom.server").await.unwrap();
/// broker.publish("loom.events.server", "s1", "{}".into()).await.unwrap();
/// assert_eq!(rx.recv().await.unwrap().key, "s1");
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, HashMap<String, GroupMembers>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<()> {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        let Some(groups) = topics.get_mut(topic) else {
            debug!(topic, "publish to topic with no consumers");
            return Ok(());
        };
        for (group, members) in groups.iter_mut() {
            // Drop senders whose receivers are gone before picking a member.
            members.senders.retain(|tx| !tx.is_closed());
            if members.senders.is_empty() {
                continue;
            }
            let idx = members.next.fetch_add(1, Ordering::Relaxed) % members.senders.len();
            let message = BrokerMessage {
                key: key.to_string(),
                payload: payload.clone(),
            };
            members.senders[idx].send(message).map_err(|_| {
                LoomError::Broker(format!("consumer group '{}' closed mid-send", group))
            })?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<BrokerReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        topics
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(|| GroupMembers {
                senders: Vec::new(),
                next: AtomicUsize::new(0),
            })
            .senders
            .push(tx);
        debug!(topic, group, "consumer subscribed");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_naming() {
        assert_eq!(
            topic_for("loom", SubscriberKind::Server),
            "loom.events.server"
        );
        assert_eq!(
            group_for("loom-consumers", SubscriberKind::Memory),
            "loom-consumers.memory"
        );
    }

    #[tokio::test]
    async fn test_each_group_receives_every_message() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("t", "group-a").await.unwrap();
        let mut b = broker.subscribe("t", "group-b").await.unwrap();
        broker.publish("t", "s1", "one".into()).await.unwrap();
        assert_eq!(a.recv().await.unwrap().payload, "one");
        assert_eq!(b.recv().await.unwrap().payload, "one");
    }

    #[tokio::test]
    async fn test_group_members_share_the_stream() {
        let broker = InMemoryBroker::new();
        let mut first = broker.subscribe("t", "g").await.unwrap();
        let mut second = broker.subscribe("t", "g").await.unwrap();
        broker.publish("t", "s1", "one".into()).await.unwrap();
        broker.publish("t", "s1", "two".into()).await.unwrap();
        // Round-robin: one message each, in some order.
        let x = first.recv().await.unwrap().payload;
        let y = second.recv().await.unwrap().payload;
        let mut got = vec![x, y];
        got.sort();
        assert_eq!(got, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_publish_without_consumers_is_ok() {
        let broker = InMemoryBroker::new();
        broker.publish("empty", "s1", "{}".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let broker = InMemoryBroker::new();
        let rx = broker.subscribe("t", "g").await.unwrap();
        drop(rx);
        broker.publish("t", "s1", "{}".into()).await.unwrap();
    }
}
