//! Manager module - conversation scheduling on one node
//!
//! The [`ConversationManager`] decides which conversations run an agent loop,
//! tracks which clients are attached to which conversation, and reclaims
//! resources when clients go away. All of its maps live behind one async
//! mutex; the background reaper takes the same lock once per sweep.

pub mod conversation;
pub mod session;

pub use conversation::{Conversation, NoopRuntime, Runtime};
pub use session::{AgentState, Session};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::condenser::CondenserPipeline;
use crate::config::ManagerConfig;
use crate::error::Result;
use crate::events::store::{session_exists, EventStore};
use crate::events::stream::EventStream;
use crate::storage::FileStore;

/// Per-conversation settings supplied by the joining client.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Secrets to redact from persisted records.
    pub secrets: HashMap<String, String>,
}

/// Fresh connection id for [`ConversationManager::join_conversation`].
pub fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

struct ManagerState {
    /// Running sessions by sid
    sessions: HashMap<String, Arc<Session>>,
    /// Attached conversation handles with their client refcount (>= 1)
    active: HashMap<String, (Arc<Conversation>, usize)>,
    /// Fully detached handles awaiting eviction, with detach time
    detached: HashMap<String, (Arc<Conversation>, Instant)>,
    /// connection id -> sid
    connections: HashMap<String, String>,
}

/// Schedules agent loops and client attachments for one node.
///
/// Constructed with its collaborators injected: the storage backend, the
/// agent implementation, the condenser pipeline and the runtime backing
/// conversation handles.
pub struct ConversationManager {
    config: ManagerConfig,
    file_store: Arc<dyn FileStore>,
    cache_size: usize,
    agent: Arc<dyn Agent>,
    pipeline: Arc<CondenserPipeline>,
    runtime: Arc<dyn Runtime>,
    state: Mutex<ManagerState>,
    shutdown: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationManager {
    pub fn new(
        config: ManagerConfig,
        file_store: Arc<dyn FileStore>,
        cache_size: usize,
        agent: Arc<dyn Agent>,
        pipeline: Arc<CondenserPipeline>,
        runtime: Arc<dyn Runtime>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            file_store,
            cache_size,
            agent,
            pipeline,
            runtime,
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                active: HashMap::new(),
                detached: HashMap::new(),
                connections: HashMap::new(),
            }),
            shutdown,
            reaper: Mutex::new(None),
        })
    }

    /// Spawn the background reaper. Call once after construction.
    pub async fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.reap_interval_secs);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        manager.force_cleanup().await;
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        manager.sweep().await;
                    }
                }
            }
        });
        *self.reaper.lock().await = Some(task);
        info!(reap_interval_secs = self.config.reap_interval_secs, "conversation manager started");
    }

    /// Stop the reaper and force-close everything.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.reaper.lock().await.take();
        if let Some(mut task) = task {
            if timeout(Duration::from_secs(10), &mut task).await.is_err() {
                warn!("reaper did not stop in time, aborting");
                task.abort();
                self.force_cleanup().await;
            }
        } else {
            // Never started; clean up directly.
            self.force_cleanup().await;
        }
        info!("conversation manager stopped");
    }

    /// Bounded read-only store positioned at the end of persisted history.
    fn read_only_store(&self, sid: &str, user_id: Option<&str>) -> EventStore {
        let probe =
            EventStore::with_cur_id(sid, Arc::clone(&self.file_store), user_id, self.cache_size, 0);
        let cur_id = probe.latest_persisted_id() + 1;
        EventStore::with_cur_id(
            sid,
            Arc::clone(&self.file_store),
            user_id,
            self.cache_size,
            cur_id,
        )
    }

    fn running_loops_for(state: &ManagerState, user_id: Option<&str>) -> usize {
        state
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal() && s.user_id.as_deref() == user_id)
            .count()
    }

    /// Ensure an agent loop is running for `sid`, within the per-user limit.
    ///
    /// Returns a live-positioned [`EventStore`] when the session is (now)
    /// running. At the concurrency limit no existing session is evicted;
    /// the caller gets a read-only store over persisted history instead.
    pub async fn maybe_start_agent_loop(
        &self,
        sid: &str,
        settings: &SessionSettings,
        user_id: Option<&str>,
    ) -> Result<EventStore> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get(sid) {
            if !session.is_closed() {
                return Ok(session.stream().as_store());
            }
            state.sessions.remove(sid);
        }

        let limit = self.config.max_concurrent_conversations;
        if limit > 0 && Self::running_loops_for(&state, user_id) >= limit {
            info!(
                sid,
                limit, "concurrent conversation limit reached, serving read-only history"
            );
            return Ok(self.read_only_store(sid, user_id));
        }

        let stream = Arc::new(EventStream::new(
            sid,
            Arc::clone(&self.file_store),
            user_id,
            self.cache_size,
        ));
        if !settings.secrets.is_empty() {
            stream.set_secrets(settings.secrets.clone());
        }
        let session = Session::start(
            sid,
            user_id,
            Arc::clone(&stream),
            Arc::clone(&self.agent),
            Arc::clone(&self.pipeline),
        );
        let store = session.stream().as_store();
        state.sessions.insert(sid.to_string(), session);
        Ok(store)
    }

    /// Record a client connection, then make sure the loop is running.
    pub async fn join_conversation(
        &self,
        sid: &str,
        connection_id: &str,
        settings: &SessionSettings,
        user_id: Option<&str>,
    ) -> Result<EventStore> {
        {
            let mut state = self.state.lock().await;
            state
                .connections
                .insert(connection_id.to_string(), sid.to_string());
        }
        self.maybe_start_agent_loop(sid, settings, user_id).await
    }

    /// Attach a client to a conversation handle.
    ///
    /// Active handles are shared (refcount + 1, same `Arc`); a detached handle
    /// is promoted back intact. Otherwise a handle is built for a persisted
    /// conversation and its runtime connected; `None` when the conversation
    /// was never persisted or the runtime is unreachable.
    pub async fn attach_to_conversation(
        &self,
        sid: &str,
        user_id: Option<&str>,
    ) -> Option<Arc<Conversation>> {
        let mut state = self.state.lock().await;
        if let Some((conversation, count)) = state.active.get_mut(sid) {
            *count += 1;
            return Some(Arc::clone(conversation));
        }
        if let Some((conversation, _detached_at)) = state.detached.remove(sid) {
            state
                .active
                .insert(sid.to_string(), (Arc::clone(&conversation), 1));
            return Some(conversation);
        }
        if !session_exists(sid, user_id, self.file_store.as_ref()) {
            return None;
        }
        let conversation = Arc::new(Conversation::new(sid, user_id, Arc::clone(&self.runtime)));
        if let Err(e) = conversation.connect().await {
            error!(sid, error = %e, "runtime connect failed");
            if let Err(e) = conversation.disconnect().await {
                debug!(sid, error = %e, "disconnect after failed connect");
            }
            return None;
        }
        state
            .active
            .insert(sid.to_string(), (Arc::clone(&conversation), 1));
        Some(conversation)
    }

    /// Release one client's reference; the last detach starts the grace
    /// period until the next reaper sweep.
    pub async fn detach_from_conversation(&self, sid: &str) {
        let mut state = self.state.lock().await;
        let Some((conversation, count)) = state.active.get_mut(sid) else {
            warn!(sid, "detach from unknown conversation");
            return;
        };
        *count -= 1;
        if *count == 0 {
            let conversation = Arc::clone(conversation);
            state.active.remove(sid);
            state
                .detached
                .insert(sid.to_string(), (conversation, Instant::now()));
        }
    }

    /// Drop a connection mapping; close the session when its agent is done
    /// and nobody else is connected.
    pub async fn disconnect_from_session(&self, connection_id: &str) {
        let mut state = self.state.lock().await;
        let Some(sid) = state.connections.remove(connection_id) else {
            return;
        };
        let still_connected = state.connections.values().any(|s| *s == sid);
        let terminal = state
            .sessions
            .get(&sid)
            .map(|s| s.state().is_terminal())
            .unwrap_or(false);
        if terminal && !still_connected {
            Self::close_session_locked(&mut state, &sid).await;
        }
    }

    /// Close a session and drop its connection mappings. Idempotent.
    pub async fn close_session(&self, sid: &str) {
        let mut state = self.state.lock().await;
        Self::close_session_locked(&mut state, sid).await;
    }

    async fn close_session_locked(state: &mut ManagerState, sid: &str) {
        state.connections.retain(|_, s| s != sid);
        if let Some(session) = state.sessions.remove(sid) {
            session.close().await;
        }
    }

    /// Sids of non-terminal agent loops, optionally filtered by user and sid
    /// set.
    pub async fn get_running_agent_loops(
        &self,
        user_id: Option<&str>,
        filter: Option<&HashSet<String>>,
    ) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .filter(|s| !s.is_closed() && !s.state().is_terminal())
            .filter(|s| user_id.is_none() || s.user_id.as_deref() == user_id)
            .filter(|s| filter.map_or(true, |f| f.contains(&s.sid)))
            .map(|s| s.sid.clone())
            .collect()
    }

    /// Connection id -> sid, optionally filtered by user and sid set.
    pub async fn get_connections(
        &self,
        user_id: Option<&str>,
        filter: Option<&HashSet<String>>,
    ) -> HashMap<String, String> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .filter(|(_, sid)| filter.map_or(true, |f| f.contains(*sid)))
            .filter(|(_, sid)| {
                user_id.is_none()
                    || state
                        .sessions
                        .get(*sid)
                        .map(|s| s.user_id.as_deref() == user_id)
                        .unwrap_or(false)
            })
            .map(|(conn, sid)| (conn.clone(), sid.clone()))
            .collect()
    }

    /// One reaper pass: evict every detached handle, close idle sessions.
    async fn sweep(&self) {
        let close_delay = Duration::from_secs(self.config.close_delay_secs);
        let mut state = self.state.lock().await;

        // Detached handles get exactly one grace period: until this sweep.
        let detached: Vec<(String, Arc<Conversation>)> = state
            .detached
            .drain()
            .map(|(sid, (conversation, _))| (sid, conversation))
            .collect();
        for (sid, conversation) in detached {
            debug!(sid = %sid, "evicting detached conversation");
            if let Err(e) = conversation.disconnect().await {
                warn!(sid = %sid, error = %e, "runtime disconnect failed during sweep");
            }
        }

        // Idle sessions: not running, not unset, no live connections.
        let idle: Vec<String> = state
            .sessions
            .values()
            .filter(|s| {
                let agent_state = s.state();
                !agent_state.is_running()
                    && agent_state != AgentState::Unset
                    && s.idle_for() > close_delay
            })
            .map(|s| s.sid.clone())
            .collect();
        for sid in idle {
            // Connection check happens at sweep time, after the idle check.
            if state.connections.values().any(|s| *s == sid) {
                continue;
            }
            info!(sid = %sid, "closing idle session");
            Self::close_session_locked(&mut state, &sid).await;
        }
    }

    /// Shutdown path: disconnect everything and close every session.
    async fn force_cleanup(&self) {
        let mut state = self.state.lock().await;
        let mut handles: Vec<(String, Arc<Conversation>)> = state
            .active
            .drain()
            .map(|(sid, (c, _))| (sid, c))
            .collect();
        handles.extend(state.detached.drain().map(|(sid, (c, _))| (sid, c)));
        for (sid, conversation) in handles {
            if let Err(e) = conversation.disconnect().await {
                warn!(sid = %sid, error = %e, "runtime disconnect failed during shutdown");
            }
        }
        let sids: Vec<String> = state.sessions.keys().cloned().collect();
        for sid in sids {
            Self::close_session_locked(&mut state, &sid).await;
        }
        state.connections.clear();
    }
}
