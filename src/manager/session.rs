//! One running conversation: its stream, its agent loop, its lifecycle.
//!
//! A [`Session`] owns the event stream and the spawned agent loop task. The
//! loop replays history into a view, runs the condenser pipeline, asks the
//! agent for its next event and writes it back. State transitions travel
//! through the log itself as `state_change` events, so every subscriber sees
//! them in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::condenser::{Condensed, Condenser, CondenserPipeline, RollingMetrics, View};
use crate::error::LoomError;
use crate::events::event::{Event, EventPayload, EventSource};
use crate::events::stream::{EventStream, SubscriberKind};

/// Lifecycle state of a session's agent, mirrored from `state_change` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    /// No state has been reported yet
    #[default]
    Unset,
    Loading,
    Running,
    AwaitingUserInput,
    Finished,
    Error,
    Stopped,
}

impl AgentState {
    pub fn from_str(s: &str) -> Self {
        match s {
            "loading" => AgentState::Loading,
            "running" => AgentState::Running,
            "awaiting_user_input" => AgentState::AwaitingUserInput,
            "finished" => AgentState::Finished,
            "error" => AgentState::Error,
            "stopped" => AgentState::Stopped,
            _ => AgentState::Unset,
        }
    }

    /// Terminal states end the agent loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Finished | AgentState::Error | AgentState::Stopped
        )
    }

    pub fn is_running(&self) -> bool {
        *self == AgentState::Running
    }
}

/// A live conversation with a background agent loop.
pub struct Session {
    pub sid: String,
    pub user_id: Option<String>,
    stream: Arc<EventStream>,
    state: Mutex<AgentState>,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create the session and spawn its agent loop.
    ///
    /// The session subscribes to its own stream under the agent-controller
    /// category: every appended event refreshes the activity clock, state
    /// changes update [`AgentState`], and non-agent events wake the loop.
    pub fn start(
        sid: &str,
        user_id: Option<&str>,
        stream: Arc<EventStream>,
        agent: Arc<dyn Agent>,
        pipeline: Arc<CondenserPipeline>,
    ) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            sid: sid.to_string(),
            user_id: user_id.map(str::to_string),
            stream,
            state: Mutex::new(AgentState::Unset),
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown,
            task: Mutex::new(None),
        });

        let observer = Arc::clone(&session);
        let subscribed = session.stream.subscribe(
            SubscriberKind::AgentController,
            &format!("session-{}", sid),
            Arc::new(move |event| observer.observe(event)),
        );
        if let Err(e) = subscribed {
            warn!(sid, error = %e, "session could not subscribe to its own stream");
        }

        let task = tokio::spawn(Self::run_loop(
            Arc::clone(&session),
            agent,
            pipeline,
            shutdown_rx,
        ));
        *session.task.lock().expect("session lock poisoned") = Some(task);
        info!(sid, "session started");
        session
    }

    /// The session's event stream.
    pub fn stream(&self) -> &Arc<EventStream> {
        &self.stream
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("session lock poisoned")
    }

    pub fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("session lock poisoned") = state;
    }

    /// How long since the session last saw an event.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().expect("session lock poisoned").elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_active.lock().expect("session lock poisoned") = Instant::now();
    }

    /// Stream-subscription callback: runs synchronously on the writer.
    fn observe(&self, event: &Event) {
        self.touch();
        match &event.payload {
            EventPayload::StateChange { state } => {
                self.set_state(AgentState::from_str(state));
            }
            EventPayload::Finish { .. } => {
                self.set_state(AgentState::Finished);
            }
            _ => {}
        }
        if event.source != Some(EventSource::Agent) {
            self.wake.notify_one();
        }
    }

    async fn run_loop(
        session: Arc<Session>,
        agent: Arc<dyn Agent>,
        pipeline: Arc<CondenserPipeline>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let metrics = RollingMetrics::default();
        loop {
            if *shutdown.borrow() || session.state().is_terminal() {
                break;
            }

            let events: Vec<Event> = match session.stream.get_events(0, None, false) {
                Ok(iter) => iter.collect(),
                // Nothing persisted yet: a brand-new session starts empty.
                Err(LoomError::NotFound(_)) => Vec::new(),
                Err(e) => {
                    error!(sid = %session.sid, error = %e, "agent loop cannot replay history");
                    Vec::new()
                }
            };
            let view = View::new(events);
            let view = match pipeline.condense(&view, &metrics).await {
                Ok(Condensed::View(view)) => view,
                Ok(Condensed::Condensation(condensation)) => {
                    // Persist the marker, then rebuild the view next iteration.
                    if let Err(e) = session
                        .stream
                        .add_event(condensation.to_event(), EventSource::Agent)
                    {
                        error!(sid = %session.sid, error = %e, "failed to persist condensation");
                    }
                    continue;
                }
                Err(e) => {
                    error!(sid = %session.sid, error = %e, "condenser pipeline failed, stepping on the full view");
                    view
                }
            };

            match agent.step(&view).await {
                Ok(Some(event)) => {
                    if let Err(e) = session.stream.add_event(event, EventSource::Agent) {
                        error!(sid = %session.sid, error = %e, "agent produced an unappendable event");
                        session.set_state(AgentState::Error);
                        break;
                    }
                }
                Ok(None) => {
                    // Nothing to do; wait for new input or shutdown.
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = session.wake.notified() => {}
                    }
                }
                Err(e) => {
                    error!(sid = %session.sid, error = %e, "agent step failed");
                    session.set_state(AgentState::Error);
                    break;
                }
            }
        }
        debug!(sid = %session.sid, "agent loop ended");
    }

    /// Close the session: stop the loop, drop subscriptions.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.wake.notify_one();
        let task = self.task.lock().expect("session lock poisoned").take();
        if let Some(mut task) = task {
            if timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!(sid = %self.sid, "agent loop did not stop in time, aborting");
                task.abort();
            }
        }
        self.stream
            .unsubscribe(SubscriberKind::AgentController, &format!("session-{}", self.sid));
        self.stream.close();
        info!(sid = %self.sid, "session closed");
    }
}
