//! Append-only event stream with local fan-out.
//!
//! The stream owns the write path of a conversation's log: id assignment,
//! secret redaction, durable persistence, page archival and synchronous
//! delivery to in-process subscribers. Reads go through the bundled
//! [`EventStore`] view, which never takes the write lock.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{LoomError, Result};
use crate::events::event::{Event, EventSource};
use crate::events::store::EventStore;
use crate::storage::{locations, FileStore};

/// Replacement text written over secret values in persisted records.
pub const SECRET_MASK: &str = "<secret_hidden>";

/// The fixed set of in-process subscriber categories.
///
/// Dispatch iterates categories in this declaration order (the derived `Ord`),
/// so delivery order across categories is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberKind {
    AgentController,
    SecurityAnalyzer,
    Memory,
    Runtime,
    Server,
}

impl SubscriberKind {
    /// All categories, in dispatch order.
    pub const ALL: [SubscriberKind; 5] = [
        SubscriberKind::AgentController,
        SubscriberKind::SecurityAnalyzer,
        SubscriberKind::Memory,
        SubscriberKind::Runtime,
        SubscriberKind::Server,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberKind::AgentController => "agent_controller",
            SubscriberKind::SecurityAnalyzer => "security_analyzer",
            SubscriberKind::Memory => "memory",
            SubscriberKind::Runtime => "runtime",
            SubscriberKind::Server => "server",
        }
    }
}

impl std::fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous subscriber callback. Shared between the local registry and the
/// distributed consumer pool, hence the `Arc`.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct WriteState {
    /// Next id to assign
    cur_id: i64,
    /// Redacted records waiting to be archived as a page
    page_cache: Vec<Value>,
    /// Secret name -> secret value; values are masked in persisted records
    secrets: HashMap<String, String>,
}

/// Append-only log for one conversation.
///
/// Writers serialize on an internal lock; persistence happens inside the
/// critical section, subscriber fan-out after it. Readers use
/// [`EventStream::as_store`] and never contend with writers.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use eventloom::events::{Event, EventSource, EventStream};
/// use eventloom::storage::InMemoryFileStore;
///
/// let file_store: Arc<dyn eventloom::storage::FileStore> = Arc::new(InMemoryFileStore::new());
/// let stream = EventStream::new("s1", file_store, None, 25);
/// let id = stream.add_event(Event::message("hello"), EventSource::User).unwrap();
/// assert_eq!(id, 0);
/// assert_eq!(stream.get_latest_event_id(), 0);
/// ```
pub struct EventStream {
    pub sid: String,
    pub user_id: Option<String>,
    file_store: Arc<dyn FileStore>,
    cache_size: usize,
    state: Mutex<WriteState>,
    subscribers: Mutex<BTreeMap<SubscriberKind, HashMap<String, EventCallback>>>,
}

impl EventStream {
    /// Open (or resume) the stream for a conversation.
    ///
    /// Resuming scans storage for the highest persisted id, so ids stay
    /// monotonic and gap-free across process restarts.
    pub fn new(
        sid: &str,
        file_store: Arc<dyn FileStore>,
        user_id: Option<&str>,
        cache_size: usize,
    ) -> Self {
        let store = EventStore::with_cur_id(sid, Arc::clone(&file_store), user_id, cache_size, 0);
        let cur_id = store.latest_persisted_id() + 1;
        Self {
            sid: sid.to_string(),
            user_id: user_id.map(str::to_string),
            file_store,
            cache_size,
            state: Mutex::new(WriteState {
                cur_id,
                page_cache: Vec::new(),
                secrets: HashMap::new(),
            }),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    /// A read-only view bounded at the current end of the log.
    pub fn as_store(&self) -> EventStore {
        let cur_id = self.state.lock().expect("stream lock poisoned").cur_id;
        EventStore::with_cur_id(
            &self.sid,
            Arc::clone(&self.file_store),
            self.user_id.as_deref(),
            self.cache_size,
            cur_id,
        )
    }

    /// Id of the most recently appended event, or -1 when the log is empty.
    pub fn get_latest_event_id(&self) -> i64 {
        self.state.lock().expect("stream lock poisoned").cur_id - 1
    }

    /// Replay persisted events; see [`EventStore::get_events`].
    pub fn get_events(
        &self,
        start_id: i64,
        end_id: Option<i64>,
        reverse: bool,
    ) -> Result<crate::events::store::EventIter> {
        self.as_store().get_events(start_id, end_id, reverse)
    }

    /// Replace the redaction map wholesale.
    pub fn set_secrets(&self, secrets: HashMap<String, String>) {
        self.state.lock().expect("stream lock poisoned").secrets = secrets;
    }

    /// Add or overwrite individual secrets, keeping existing ones.
    pub fn update_secrets(&self, secrets: HashMap<String, String>) {
        self.state
            .lock()
            .expect("stream lock poisoned")
            .secrets
            .extend(secrets);
    }

    /// Register a callback under `(kind, callback_id)`.
    ///
    /// Ids must be unique within a category; re-registering is an error so a
    /// misbehaving client cannot silently replace another's subscription.
    pub fn subscribe(
        &self,
        kind: SubscriberKind,
        callback_id: &str,
        callback: EventCallback,
    ) -> Result<()> {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let callbacks = subscribers.entry(kind).or_default();
        if callbacks.contains_key(callback_id) {
            return Err(LoomError::DuplicateCallback {
                subscriber: kind.to_string(),
                callback_id: callback_id.to_string(),
            });
        }
        callbacks.insert(callback_id.to_string(), callback);
        debug!(sid = %self.sid, subscriber = %kind, callback_id, "subscribed");
        Ok(())
    }

    /// Remove a callback. Unknown ids are logged, not errors, so teardown
    /// paths can unsubscribe unconditionally.
    pub fn unsubscribe(&self, kind: SubscriberKind, callback_id: &str) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let removed = subscribers
            .get_mut(&kind)
            .and_then(|callbacks| callbacks.remove(callback_id));
        if removed.is_none() {
            warn!(sid = %self.sid, subscriber = %kind, callback_id, "unsubscribe for unknown callback");
        }
    }

    /// Append an event: assign the next id, stamp metadata, persist the
    /// redacted record and fan out to subscribers.
    ///
    /// Returns the assigned id. Fails with [`LoomError::FeedbackLoop`] when
    /// the event already carries an id, which means a subscriber re-submitted
    /// an event it was handed.
    pub fn add_event(&self, event: Event, source: EventSource) -> Result<i64> {
        let (event, _record) = self.record(event, source)?;
        let id = event.id;
        self.dispatch(&event);
        Ok(id)
    }

    /// The write critical section: id assignment plus persistence, no fan-out.
    /// Returns the stamped event together with its redacted record; the
    /// distributed stream publishes the record through a broker instead of
    /// dispatching locally.
    pub(crate) fn record(&self, mut event: Event, source: EventSource) -> Result<(Event, Value)> {
        if event.has_id() {
            return Err(LoomError::FeedbackLoop(event.id));
        }
        let mut state = self.state.lock().expect("stream lock poisoned");
        event.id = state.cur_id;
        state.cur_id += 1;
        event.timestamp = Some(chrono::Utc::now());
        event.source = Some(source);

        let mut record = serde_json::to_value(&event)?;
        redact(&mut record, &state.secrets);
        self.file_store.write(
            &locations::event_path(&self.sid, self.user_id.as_deref(), event.id),
            &serde_json::to_string(&record)?,
        )?;

        state.page_cache.push(record.clone());
        if state.page_cache.len() >= self.cache_size {
            let page = std::mem::take(&mut state.page_cache);
            let first = event.id - self.cache_size as i64 + 1;
            self.file_store.write(
                &locations::page_path(
                    &self.sid,
                    self.user_id.as_deref(),
                    first,
                    first + self.cache_size as i64,
                ),
                &serde_json::to_string(&page)?,
            )?;
        }
        Ok((event, record))
    }

    /// Deliver an event to every registered callback, categories in sorted
    /// order. A panicking handler is logged and skipped; it never poisons the
    /// stream or starves later handlers.
    pub(crate) fn dispatch(&self, event: &Event) {
        let callbacks: Vec<(SubscriberKind, String, EventCallback)> = {
            let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
            subscribers
                .iter()
                .flat_map(|(kind, callbacks)| {
                    let mut entries: Vec<_> = callbacks.iter().collect();
                    entries.sort_by(|a, b| a.0.cmp(b.0));
                    entries
                        .into_iter()
                        .map(|(id, cb)| (*kind, id.clone(), Arc::clone(cb)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (kind, callback_id, callback) in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                error!(
                    sid = %self.sid,
                    subscriber = %kind,
                    callback_id = %callback_id,
                    event_id = event.id,
                    "subscriber callback panicked"
                );
            }
        }
    }

    /// Drop all subscriptions. Called when a session closes so stale handlers
    /// cannot observe a reopened stream.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
    }
}

/// Recursively mask every occurrence of a secret value in `record`.
fn redact(record: &mut Value, secrets: &HashMap<String, String>) {
    if secrets.is_empty() {
        return;
    }
    match record {
        Value::String(s) => {
            for secret in secrets.values() {
                if !secret.is_empty() && s.contains(secret.as_str()) {
                    *s = s.replace(secret.as_str(), SECRET_MASK);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, secrets);
            }
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                redact(value, secrets);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryFileStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_stream(cache_size: usize) -> (EventStream, Arc<dyn FileStore>) {
        let file_store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        let stream = EventStream::new("s1", Arc::clone(&file_store), None, cache_size);
        (stream, file_store)
    }

    #[test]
    fn test_ids_are_monotonic_and_gap_free() {
        let (stream, _) = new_stream(25);
        for expected in 0..10 {
            let id = stream
                .add_event(Event::message("m"), EventSource::User)
                .unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(stream.get_latest_event_id(), 9);
    }

    #[test]
    fn test_resume_continues_numbering() {
        let (stream, file_store) = new_stream(25);
        stream.add_event(Event::message("a"), EventSource::User).unwrap();
        stream.add_event(Event::message("b"), EventSource::Agent).unwrap();
        drop(stream);

        let resumed = EventStream::new("s1", file_store, None, 25);
        let id = resumed
            .add_event(Event::message("c"), EventSource::User)
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_feedback_loop_is_rejected() {
        let (stream, _) = new_stream(25);
        let mut event = Event::message("echo");
        event.id = 0;
        let err = stream.add_event(event, EventSource::Agent).unwrap_err();
        assert!(matches!(err, LoomError::FeedbackLoop(0)));
    }

    #[test]
    fn test_page_archived_at_cache_size() {
        let (stream, file_store) = new_stream(3);
        for _ in 0..7 {
            stream.add_event(Event::message("m"), EventSource::User).unwrap();
        }
        assert!(file_store.exists(&locations::page_path("s1", None, 0, 3)));
        assert!(file_store.exists(&locations::page_path("s1", None, 3, 6)));
        assert!(!file_store.exists(&locations::page_path("s1", None, 6, 9)));

        let page: Vec<Event> = serde_json::from_str(
            &file_store
                .read(&locations::page_path("s1", None, 0, 3))
                .unwrap(),
        )
        .unwrap();
        let ids: Vec<i64> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_secrets_redacted_in_persisted_record() {
        let (stream, file_store) = new_stream(25);
        stream.set_secrets(HashMap::from([(
            "api_key".to_string(),
            "sk-12345".to_string(),
        )]));
        stream
            .add_event(
                Event::message("my key is sk-12345, keep it safe"),
                EventSource::User,
            )
            .unwrap();
        let record = file_store
            .read(&locations::event_path("s1", None, 0))
            .unwrap();
        assert!(!record.contains("sk-12345"));
        assert!(record.contains(SECRET_MASK));
    }

    #[test]
    fn test_update_secrets_extends() {
        let (stream, file_store) = new_stream(25);
        stream.set_secrets(HashMap::from([("a".to_string(), "alpha".to_string())]));
        stream.update_secrets(HashMap::from([("b".to_string(), "bravo".to_string())]));
        stream
            .add_event(Event::message("alpha bravo"), EventSource::User)
            .unwrap();
        let record = file_store
            .read(&locations::event_path("s1", None, 0))
            .unwrap();
        assert!(!record.contains("alpha"));
        assert!(!record.contains("bravo"));
    }

    #[test]
    fn test_fan_out_in_sorted_category_order() {
        let (stream, _) = new_stream(25);
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        // Register in reverse of dispatch order.
        for kind in [
            SubscriberKind::Server,
            SubscriberKind::Memory,
            SubscriberKind::AgentController,
        ] {
            let order = Arc::clone(&order);
            stream
                .subscribe(
                    kind,
                    "probe",
                    Arc::new(move |_e| order.lock().unwrap().push(kind.to_string())),
                )
                .unwrap();
        }
        stream.add_event(Event::message("m"), EventSource::User).unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["agent_controller", "memory", "server"]
        );
    }

    #[test]
    fn test_duplicate_callback_rejected() {
        let (stream, _) = new_stream(25);
        stream
            .subscribe(SubscriberKind::Server, "ui", Arc::new(|_| {}))
            .unwrap();
        let err = stream
            .subscribe(SubscriberKind::Server, "ui", Arc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, LoomError::DuplicateCallback { .. }));
    }

    #[test]
    fn test_panicking_callback_does_not_stop_dispatch() {
        let (stream, _) = new_stream(25);
        let delivered = Arc::new(AtomicUsize::new(0));
        stream
            .subscribe(
                SubscriberKind::AgentController,
                "boom",
                Arc::new(|_| panic!("handler bug")),
            )
            .unwrap();
        let counter = Arc::clone(&delivered);
        stream
            .subscribe(
                SubscriberKind::Server,
                "count",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        stream.add_event(Event::message("m"), EventSource::User).unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        // The stream stays usable after a handler panic.
        stream.add_event(Event::message("m"), EventSource::User).unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_replayable_through_store() {
        let (stream, _) = new_stream(2);
        for i in 0..5 {
            stream
                .add_event(Event::message(&format!("m{}", i)), EventSource::User)
                .unwrap();
        }
        let events: Vec<Event> = stream.get_events(0, None, false).unwrap().collect();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.timestamp.is_some()));
        assert_eq!(events[3].content(), Some("m3"));
    }
}
