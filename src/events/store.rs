//! Read-only replay of a conversation's persisted events.
//!
//! An [`EventStore`] is positioned at a fixed upper bound (`cur_id`), so it can
//! be handed to clients as a bounded view of history - this is exactly what
//! admission control returns when the concurrent-loop limit is reached.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{LoomError, Result};
use crate::events::event::Event;
use crate::storage::{locations, FileStore};

/// Default number of events per archived page.
pub const DEFAULT_CACHE_SIZE: usize = 25;

/// Whether durable storage holds any record for a conversation.
pub fn session_exists(sid: &str, user_id: Option<&str>, store: &dyn FileStore) -> bool {
    store.exists(&locations::events_dir(sid, user_id))
}

/// Read-only replay over a conversation's persisted events.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use eventloom::events::{Event, EventStore, EventStream};
/// use eventloom::events::EventSource;
/// use eventloom::storage::InMemoryFileStore;
///
/// let file_store: Arc<dyn eventloom::storage::FileStore> = Arc::new(InMemoryFileStore::new());
/// let stream = EventStream::new("s1", Arc::clone(&file_store), None, 25);
/// stream.add_event(Event::message("hello"), EventSource::User).unwrap();
///
/// let store = EventStore::new("s1", file_store, None, 25).unwrap();
/// let events: Vec<Event> = store.get_events(0, None, false).unwrap().collect();
/// assert_eq!(events.len(), 1);
/// ```
pub struct EventStore {
    /// Conversation id
    pub sid: String,
    /// Owner of the conversation, if known
    pub user_id: Option<String>,
    /// Next id a writer would assign; exclusive upper bound for replay
    pub cur_id: i64,
    pub(crate) file_store: Arc<dyn FileStore>,
    pub(crate) cache_size: usize,
}

impl EventStore {
    /// Open a store positioned at the current end of persisted history.
    ///
    /// Fails with [`LoomError::NotFound`] when storage has no record of the
    /// session at all - distinct from a session with an empty history window.
    pub fn new(
        sid: &str,
        file_store: Arc<dyn FileStore>,
        user_id: Option<&str>,
        cache_size: usize,
    ) -> Result<Self> {
        if !session_exists(sid, user_id, file_store.as_ref()) {
            return Err(LoomError::NotFound(format!("session {}", sid)));
        }
        let mut store = Self {
            sid: sid.to_string(),
            user_id: user_id.map(str::to_string),
            cur_id: 0,
            file_store,
            cache_size,
        };
        store.cur_id = store.latest_persisted_id() + 1;
        Ok(store)
    }

    /// Open a store bounded at an explicit offset (`cur_id`), without
    /// requiring persisted history to exist yet. Used by live streams and by
    /// the manager when snapshotting a running session.
    pub fn with_cur_id(
        sid: &str,
        file_store: Arc<dyn FileStore>,
        user_id: Option<&str>,
        cache_size: usize,
        cur_id: i64,
    ) -> Self {
        Self {
            sid: sid.to_string(),
            user_id: user_id.map(str::to_string),
            cur_id,
            file_store,
            cache_size,
        }
    }

    /// The highest persisted event id, or -1 when the log is empty.
    pub fn latest_persisted_id(&self) -> i64 {
        let dir = locations::events_dir(&self.sid, self.user_id.as_deref());
        let names = match self.file_store.list(&dir) {
            Ok(names) => names,
            Err(_) => return -1,
        };
        names
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|stem| stem.parse::<i64>().ok())
            .max()
            .unwrap_or(-1)
    }

    /// Replay persisted events in id order.
    ///
    /// The returned iterator is lazy (pages are read on demand), restartable
    /// (it holds no locks; call `get_events` again to re-read) and finite (it
    /// never waits for new writes past `cur_id`).
    ///
    /// # Arguments
    /// * `start_id` - first id to yield (forward) or highest id (reverse)
    /// * `end_id` - inclusive stop bound; `None` means the store's `cur_id`
    /// * `reverse` - yield ids in descending order
    pub fn get_events(
        &self,
        start_id: i64,
        end_id: Option<i64>,
        reverse: bool,
    ) -> Result<EventIter> {
        if !session_exists(&self.sid, self.user_id.as_deref(), self.file_store.as_ref())
            && self.cur_id == 0
        {
            return Err(LoomError::NotFound(format!("session {}", self.sid)));
        }
        let last = match end_id {
            Some(end) => end.min(self.cur_id - 1),
            None => self.cur_id - 1,
        };
        let (next_id, stop_id) = if reverse {
            (last, start_id.max(0) - 1)
        } else {
            (start_id.max(0), last + 1)
        };
        Ok(EventIter {
            file_store: Arc::clone(&self.file_store),
            sid: self.sid.clone(),
            user_id: self.user_id.clone(),
            cache_size: self.cache_size,
            next_id,
            stop_id,
            reverse,
            page: HashMap::new(),
        })
    }

    /// Read a single event by id.
    pub fn get_event(&self, event_id: i64) -> Result<Event> {
        let path = locations::event_path(&self.sid, self.user_id.as_deref(), event_id);
        let contents = self.file_store.read(&path)?;
        let event = serde_json::from_str(&contents)?;
        Ok(event)
    }
}

// Manual impl: the storage backend is a trait object with no Debug bound.
impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("sid", &self.sid)
            .field("user_id", &self.user_id)
            .field("cur_id", &self.cur_id)
            .field("cache_size", &self.cache_size)
            .finish_non_exhaustive()
    }
}

/// Lazy iterator over persisted events; see [`EventStore::get_events`].
///
/// Pages are loaded whole when their record exists; loose (not-yet-paged)
/// events are read individually. A record that is missing or unreadable is
/// logged and skipped rather than terminating the replay.
pub struct EventIter {
    file_store: Arc<dyn FileStore>,
    sid: String,
    user_id: Option<String>,
    cache_size: usize,
    next_id: i64,
    stop_id: i64,
    reverse: bool,
    page: HashMap<i64, Event>,
}

impl EventIter {
    fn exhausted(&self) -> bool {
        if self.reverse {
            self.next_id <= self.stop_id
        } else {
            self.next_id >= self.stop_id
        }
    }

    fn advance(&mut self) {
        if self.reverse {
            self.next_id -= 1;
        } else {
            self.next_id += 1;
        }
    }

    /// Load the archived page covering `id` into the buffer, if one exists.
    fn try_load_page(&mut self, id: i64) -> bool {
        let cache_size = self.cache_size as i64;
        let first = id - id.rem_euclid(cache_size);
        let path = locations::page_path(
            &self.sid,
            self.user_id.as_deref(),
            first,
            first + cache_size,
        );
        let contents = match self.file_store.read(&path) {
            Ok(contents) => contents,
            Err(_) => return false,
        };
        match serde_json::from_str::<Vec<Event>>(&contents) {
            Ok(events) => {
                for event in events {
                    self.page.insert(event.id, event);
                }
                true
            }
            Err(e) => {
                warn!(sid = %self.sid, page = %path, error = %e, "unreadable event page, falling back to loose records");
                false
            }
        }
    }

    fn read_loose(&self, id: i64) -> Option<Event> {
        let path = locations::event_path(&self.sid, self.user_id.as_deref(), id);
        let contents = match self.file_store.read(&path) {
            Ok(contents) => contents,
            Err(_) => return None,
        };
        match serde_json::from_str(&contents) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(sid = %self.sid, event_id = id, error = %e, "unreadable event record, skipping");
                None
            }
        }
    }
}

impl Iterator for EventIter {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        while !self.exhausted() {
            let id = self.next_id;
            self.advance();

            if let Some(event) = self.page.remove(&id) {
                return Some(event);
            }
            if self.try_load_page(id) {
                if let Some(event) = self.page.remove(&id) {
                    return Some(event);
                }
            }
            if let Some(event) = self.read_loose(id) {
                return Some(event);
            }
            warn!(sid = %self.sid, event_id = id, "missing event record, skipping");
        }
        None
    }
}
