//! Cross-node event delivery: broker-backed streams and the warm consumer
//! pool that feeds events back to local subscribers.
//!
//! A [`DistributedEventStream`] persists exactly like the local stream but
//! routes fan-out through a [`Broker`]: one topic per subscriber category,
//! partitioned by session id so a conversation's events stay ordered. On the
//! consuming side a single [`ConsumerPool`] per process runs one long-lived
//! task per category, shared by every session on the node; each task filters
//! incoming events by the session id embedded in the payload and invokes only
//! the callbacks registered for that session.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{LoomError, Result};
use crate::events::broker::{group_for, topic_for, Broker};
use crate::events::event::{Event, EventSource};
use crate::events::stream::{EventCallback, EventStream, SubscriberKind};

/// Broker-backed writer for one conversation.
///
/// Persistence is identical to [`EventStream::add_event`]; delivery differs.
/// When a publish fails or times out the event is handed to the local
/// registry instead, so subscribers on this node never miss an event the log
/// already contains.
pub struct DistributedEventStream {
    inner: Arc<EventStream>,
    broker: Arc<dyn Broker>,
    topic_prefix: String,
    flush_timeout: Duration,
}

impl DistributedEventStream {
    pub fn new(
        inner: Arc<EventStream>,
        broker: Arc<dyn Broker>,
        topic_prefix: &str,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            broker,
            topic_prefix: topic_prefix.to_string(),
            flush_timeout,
        }
    }

    /// The wrapped local stream, for reads and local subscriptions.
    pub fn stream(&self) -> &Arc<EventStream> {
        &self.inner
    }

    /// Append an event and publish it to every category topic.
    ///
    /// The published record carries a `session_id` field the persisted record
    /// does not, so pool consumers can route it without a storage lookup.
    pub async fn add_event(&self, event: Event, source: EventSource) -> Result<i64> {
        let (event, mut record) = self.inner.record(event, source)?;
        if let Value::Object(map) = &mut record {
            map.insert(
                "session_id".to_string(),
                Value::String(self.inner.sid.clone()),
            );
        }
        let payload = serde_json::to_string(&record)?;

        for kind in SubscriberKind::ALL {
            let topic = topic_for(&self.topic_prefix, kind);
            let publish = self
                .broker
                .publish(&topic, &self.inner.sid, payload.clone());
            match timeout(self.flush_timeout, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(sid = %self.inner.sid, topic, error = %e, "publish failed, falling back to local dispatch");
                    self.inner.dispatch(&event);
                    return Ok(event.id);
                }
                Err(_) => {
                    error!(sid = %self.inner.sid, topic, timeout_ms = self.flush_timeout.as_millis() as u64, "publish timed out, falling back to local dispatch");
                    self.inner.dispatch(&event);
                    return Ok(event.id);
                }
            }
        }
        Ok(event.id)
    }
}

type SessionCallbacks = HashMap<String, HashMap<String, EventCallback>>;

#[derive(Default)]
struct PoolRegistry {
    /// category -> session id -> callback id -> callback
    by_kind: HashMap<SubscriberKind, SessionCallbacks>,
}

/// Process-wide consumer pool.
///
/// Started once per node and shared across all sessions. `start` joins one
/// consumer group per category; `stop` asks the tasks to finish and waits a
/// bounded time for them.
pub struct ConsumerPool {
    broker: Arc<dyn Broker>,
    topic_prefix: String,
    group_prefix: String,
    registry: Arc<Mutex<PoolRegistry>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerPool {
    pub fn new(broker: Arc<dyn Broker>, topic_prefix: &str, group_prefix: &str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            topic_prefix: topic_prefix.to_string(),
            group_prefix: group_prefix.to_string(),
            registry: Arc::new(Mutex::new(PoolRegistry::default())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one consumer task per subscriber category.
    pub async fn start(&self) -> Result<()> {
        if !self.tasks.lock().expect("pool lock poisoned").is_empty() {
            return Err(LoomError::Broker("consumer pool already started".into()));
        }
        let mut receivers = Vec::new();
        for kind in SubscriberKind::ALL {
            let topic = topic_for(&self.topic_prefix, kind);
            let group = group_for(&self.group_prefix, kind);
            let receiver = self.broker.subscribe(&topic, &group).await?;
            receivers.push((kind, topic, group, receiver));
        }
        let mut tasks = self.tasks.lock().expect("pool lock poisoned");
        for (kind, topic, group, mut receiver) in receivers {
            let registry = Arc::clone(&self.registry);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                debug!(%topic, %group, "consumer task started");
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = receiver.recv() => {
                            let Some(message) = message else { break };
                            deliver(&registry, kind, &message.payload);
                        }
                    }
                }
                debug!(%topic, %group, "consumer task stopped");
            }));
        }
        info!(topic_prefix = %self.topic_prefix, "consumer pool started");
        Ok(())
    }

    /// Register a session callback under `(kind, sid, callback_id)`.
    pub fn register(
        &self,
        kind: SubscriberKind,
        sid: &str,
        callback_id: &str,
        callback: EventCallback,
    ) -> Result<()> {
        let mut registry = self.registry.lock().expect("pool lock poisoned");
        let callbacks = registry
            .by_kind
            .entry(kind)
            .or_default()
            .entry(sid.to_string())
            .or_default();
        if callbacks.contains_key(callback_id) {
            return Err(LoomError::DuplicateCallback {
                subscriber: kind.to_string(),
                callback_id: callback_id.to_string(),
            });
        }
        callbacks.insert(callback_id.to_string(), callback);
        Ok(())
    }

    /// Remove one callback; unknown ids are logged and ignored.
    pub fn unregister(&self, kind: SubscriberKind, sid: &str, callback_id: &str) {
        let mut registry = self.registry.lock().expect("pool lock poisoned");
        let removed = registry
            .by_kind
            .get_mut(&kind)
            .and_then(|sessions| sessions.get_mut(sid))
            .and_then(|callbacks| callbacks.remove(callback_id));
        if removed.is_none() {
            warn!(subscriber = %kind, sid, callback_id, "unregister for unknown callback");
        }
    }

    /// Drop every callback a session registered, across all categories.
    pub fn unregister_session(&self, sid: &str) {
        let mut registry = self.registry.lock().expect("pool lock poisoned");
        for sessions in registry.by_kind.values_mut() {
            sessions.remove(sid);
        }
    }

    /// Ask the consumer tasks to finish and wait up to `join_timeout` each.
    pub async fn stop(&self, join_timeout: Duration) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("pool lock poisoned"));
        for mut task in tasks {
            if timeout(join_timeout, &mut task).await.is_err() {
                warn!("consumer task did not stop within the join timeout, aborting");
                task.abort();
            }
        }
        info!("consumer pool stopped");
    }
}

/// Parse a published record and invoke the callbacks registered for its
/// session. Runs on the consumer task; a panicking callback is contained.
fn deliver(registry: &Mutex<PoolRegistry>, kind: SubscriberKind, payload: &str) {
    let event: Event = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            error!(subscriber = %kind, error = %e, "unreadable event payload, dropping");
            return;
        }
    };
    let Some(sid) = event.session_id.clone() else {
        warn!(subscriber = %kind, event_id = event.id, "published event without a session id, dropping");
        return;
    };
    let callbacks: Vec<(String, EventCallback)> = {
        let registry = registry.lock().expect("pool lock poisoned");
        match registry.by_kind.get(&kind).and_then(|s| s.get(&sid)) {
            Some(callbacks) => {
                let mut entries: Vec<_> = callbacks
                    .iter()
                    .map(|(id, cb)| (id.clone(), Arc::clone(cb)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            }
            None => return,
        }
    };
    for (callback_id, callback) in callbacks {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
        if result.is_err() {
            error!(subscriber = %kind, sid = %sid, callback_id = %callback_id, event_id = event.id, "pool callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::broker::InMemoryBroker;
    use crate::storage::{FileStore, InMemoryFileStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn distributed(sid: &str, broker: Arc<dyn Broker>) -> DistributedEventStream {
        let file_store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        let inner = Arc::new(EventStream::new(sid, file_store, None, 25));
        DistributedEventStream::new(inner, broker, "loom", Duration::from_millis(200))
    }

    async fn settle() {
        // Let the consumer tasks drain their channels.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_pool_routes_by_session() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let pool = ConsumerPool::new(Arc::clone(&broker), "loom", "loom-consumers");
        pool.start().await.unwrap();

        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits_a);
        pool.register(
            SubscriberKind::Server,
            "sess-a",
            "probe",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let counter = Arc::clone(&hits_b);
        pool.register(
            SubscriberKind::Server,
            "sess-b",
            "probe",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let stream_a = distributed("sess-a", Arc::clone(&broker));
        stream_a
            .add_event(Event::message("hello"), EventSource::User)
            .await
            .unwrap();
        settle().await;

        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);
        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_publish_failure_falls_back_to_local_dispatch() {
        struct FailingBroker;
        #[async_trait::async_trait]
        impl Broker for FailingBroker {
            async fn publish(&self, _t: &str, _k: &str, _p: String) -> Result<()> {
                Err(LoomError::Broker("down".into()))
            }
            async fn subscribe(
                &self,
                _t: &str,
                _g: &str,
            ) -> Result<crate::events::broker::BrokerReceiver> {
                Err(LoomError::Broker("down".into()))
            }
        }

        let stream = distributed("s1", Arc::new(FailingBroker));
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        stream
            .stream()
            .subscribe(
                SubscriberKind::Server,
                "local",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let id = stream
            .add_event(Event::message("hello"), EventSource::User)
            .await
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        // The event was persisted despite the broker outage.
        assert_eq!(stream.stream().get_latest_event_id(), 0);
    }

    #[tokio::test]
    async fn test_unregister_session_clears_all_kinds() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let pool = ConsumerPool::new(Arc::clone(&broker), "loom", "loom-consumers");
        pool.start().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for kind in [SubscriberKind::Server, SubscriberKind::Memory] {
            let counter = Arc::clone(&hits);
            pool.register(
                kind,
                "s1",
                "probe",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }
        pool.unregister_session("s1");

        let stream = distributed("s1", Arc::clone(&broker));
        stream
            .add_event(Event::message("hello"), EventSource::User)
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_is_bounded() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let pool = ConsumerPool::new(broker, "loom", "loom-consumers");
        pool.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), pool.stop(Duration::from_secs(1)))
            .await
            .expect("stop should finish promptly");
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let pool = ConsumerPool::new(broker, "loom", "loom-consumers");
        pool.start().await.unwrap();
        assert!(pool.start().await.is_err());
        pool.stop(Duration::from_secs(1)).await;
    }
}
