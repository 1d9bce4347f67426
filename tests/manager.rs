//! Integration tests for the conversation manager: admission control,
//! attach/detach refcounting, connection bookkeeping and the reaper.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventloom::agent::Agent;
use eventloom::condenser::{CondenserPipeline, View};
use eventloom::config::ManagerConfig;
use eventloom::events::{Event, EventSource, EventStream};
use eventloom::manager::{ConversationManager, Runtime, SessionSettings};
use eventloom::storage::{FileStore, InMemoryFileStore};
use eventloom::Result;

/// Agent that never has anything to do; sessions stay alive until closed.
struct IdleAgent;

#[async_trait]
impl Agent for IdleAgent {
    async fn step(&self, _view: &View) -> Result<Option<Event>> {
        Ok(None)
    }
}

/// Runtime that counts connects/disconnects and can be told to fail.
#[derive(Default)]
struct CountingRuntime {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_connect: bool,
}

#[async_trait]
impl Runtime for CountingRuntime {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(eventloom::LoomError::RuntimeUnavailable(
                "sandbox offline".into(),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn manager_with(
    config: ManagerConfig,
    runtime: Arc<CountingRuntime>,
) -> (Arc<ConversationManager>, Arc<dyn FileStore>) {
    let file_store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let manager = ConversationManager::new(
        config,
        Arc::clone(&file_store),
        25,
        Arc::new(IdleAgent),
        Arc::new(CondenserPipeline::new(vec![])),
        runtime,
    );
    (manager, file_store)
}

fn persist_conversation(file_store: &Arc<dyn FileStore>, sid: &str) {
    let stream = EventStream::new(sid, Arc::clone(file_store), None, 25);
    stream
        .add_event(Event::message("seed"), EventSource::User)
        .unwrap();
}

#[tokio::test]
async fn admission_control_serves_read_only_history_at_the_limit() {
    let config = ManagerConfig {
        max_concurrent_conversations: 1,
        ..ManagerConfig::default()
    };
    let (manager, file_store) = manager_with(config, Arc::new(CountingRuntime::default()));
    let settings = SessionSettings::default();

    let live = manager
        .maybe_start_agent_loop("first", &settings, None)
        .await
        .unwrap();
    assert_eq!(live.cur_id, 0);

    // Seed some history for the rejected conversation.
    persist_conversation(&file_store, "second");

    let read_only = manager
        .maybe_start_agent_loop("second", &settings, None)
        .await
        .unwrap();
    // The persisted event is visible through the bounded store.
    let events: Vec<Event> = read_only.get_events(0, None, false).unwrap().collect();
    assert_eq!(events.len(), 1);

    // No second loop started, and the first was not evicted.
    let running = manager.get_running_agent_loops(None, None).await;
    assert_eq!(running.len(), 1);
    assert!(running.contains("first"));

    // Asking again for a running conversation returns a live store.
    let again = manager
        .maybe_start_agent_loop("first", &settings, None)
        .await
        .unwrap();
    assert_eq!(again.sid, "first");

    manager.stop().await;
}

#[tokio::test]
async fn limits_are_per_user() {
    let config = ManagerConfig {
        max_concurrent_conversations: 1,
        ..ManagerConfig::default()
    };
    let (manager, _) = manager_with(config, Arc::new(CountingRuntime::default()));
    let settings = SessionSettings::default();

    manager
        .maybe_start_agent_loop("a", &settings, Some("alice"))
        .await
        .unwrap();
    manager
        .maybe_start_agent_loop("b", &settings, Some("bob"))
        .await
        .unwrap();

    assert_eq!(
        manager
            .get_running_agent_loops(Some("alice"), None)
            .await
            .len(),
        1
    );
    assert_eq!(
        manager.get_running_agent_loops(None, None).await.len(),
        2
    );
    manager.stop().await;
}

#[tokio::test]
async fn attach_refcounts_and_preserves_identity() {
    let runtime = Arc::new(CountingRuntime::default());
    let (manager, file_store) = manager_with(ManagerConfig::default(), Arc::clone(&runtime));
    persist_conversation(&file_store, "c1");

    let first = manager.attach_to_conversation("c1", None).await.unwrap();
    let second = manager.attach_to_conversation("c1", None).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    // One handle, one runtime connect.
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 1);

    // Drop one of two references; the handle stays active.
    manager.detach_from_conversation("c1").await;
    let third = manager.attach_to_conversation("c1", None).await.unwrap();
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 1);

    manager.stop().await;
}

#[tokio::test]
async fn reattach_before_sweep_preserves_identity() {
    let runtime = Arc::new(CountingRuntime::default());
    let config = ManagerConfig {
        reap_interval_secs: 3600,
        ..ManagerConfig::default()
    };
    let (manager, file_store) = manager_with(config, Arc::clone(&runtime));
    persist_conversation(&file_store, "c1");

    let first = manager.attach_to_conversation("c1", None).await.unwrap();
    manager.detach_from_conversation("c1").await;
    // Fully detached but not yet swept: same handle comes back.
    let second = manager.attach_to_conversation("c1", None).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 0);

    manager.stop().await;
}

#[tokio::test]
async fn unpersisted_conversation_cannot_be_attached() {
    let (manager, _) = manager_with(ManagerConfig::default(), Arc::new(CountingRuntime::default()));
    assert!(manager.attach_to_conversation("ghost", None).await.is_none());
    manager.stop().await;
}

#[tokio::test]
async fn runtime_failure_on_attach_yields_none() {
    let runtime = Arc::new(CountingRuntime {
        fail_connect: true,
        ..CountingRuntime::default()
    });
    let (manager, file_store) = manager_with(ManagerConfig::default(), Arc::clone(&runtime));
    persist_conversation(&file_store, "c1");

    assert!(manager.attach_to_conversation("c1", None).await.is_none());
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 1);
    manager.stop().await;
}

#[tokio::test]
async fn join_records_connections_and_close_session_is_idempotent() {
    let (manager, _) = manager_with(ManagerConfig::default(), Arc::new(CountingRuntime::default()));
    let settings = SessionSettings::default();

    let connection_id = eventloom::manager::new_connection_id();
    let store = manager
        .join_conversation("c1", &connection_id, &settings, None)
        .await
        .unwrap();
    assert_eq!(store.sid, "c1");

    let connections = manager.get_connections(None, None).await;
    assert_eq!(connections.get(&connection_id), Some(&"c1".to_string()));
    assert!(manager
        .get_running_agent_loops(None, None)
        .await
        .contains("c1"));

    manager.close_session("c1").await;
    // Idempotent.
    manager.close_session("c1").await;
    assert!(manager.get_running_agent_loops(None, None).await.is_empty());
    assert!(manager.get_connections(None, None).await.is_empty());

    manager.stop().await;
}

/// Agent whose first step immediately finishes the conversation.
struct FinishingAgent;

#[async_trait]
impl Agent for FinishingAgent {
    async fn step(&self, view: &View) -> Result<Option<Event>> {
        if view.iter().any(|e| e.is_finish()) {
            return Ok(None);
        }
        Ok(Some(Event::finish("done")))
    }
}

#[tokio::test]
async fn disconnecting_the_last_connection_closes_a_finished_session() {
    let file_store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
    let manager = ConversationManager::new(
        ManagerConfig::default(),
        Arc::clone(&file_store),
        25,
        Arc::new(FinishingAgent),
        Arc::new(CondenserPipeline::new(vec![])),
        Arc::new(CountingRuntime::default()),
    );
    let settings = SessionSettings::default();

    manager
        .join_conversation("c1", "conn-1", &settings, None)
        .await
        .unwrap();

    // Let the agent loop run its finishing step.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.get_running_agent_loops(None, None).await.is_empty());

    manager.disconnect_from_session("conn-1").await;
    assert!(manager.get_connections(None, None).await.is_empty());

    // The finish event was persisted; a fresh loop resumes after it.
    let store = manager
        .maybe_start_agent_loop("c1", &settings, None)
        .await
        .unwrap();
    assert_eq!(store.cur_id, 1);

    manager.stop().await;
}

#[tokio::test]
async fn reaper_evicts_detached_conversations() {
    let runtime = Arc::new(CountingRuntime::default());
    let config = ManagerConfig {
        reap_interval_secs: 1,
        ..ManagerConfig::default()
    };
    let (manager, file_store) = manager_with(config, Arc::clone(&runtime));
    persist_conversation(&file_store, "c1");
    manager.start().await;

    let first = manager.attach_to_conversation("c1", None).await.unwrap();
    manager.detach_from_conversation("c1").await;

    // Wait for a sweep to evict the detached handle.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 1);

    // Reattaching now builds a fresh handle with a fresh connect.
    let second = manager.attach_to_conversation("c1", None).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 2);

    manager.stop().await;
}

#[tokio::test]
async fn stop_disconnects_active_and_detached_handles_alike() {
    let runtime = Arc::new(CountingRuntime::default());
    let config = ManagerConfig {
        reap_interval_secs: 3600,
        ..ManagerConfig::default()
    };
    let (manager, file_store) = manager_with(config, Arc::clone(&runtime));
    persist_conversation(&file_store, "held");
    persist_conversation(&file_store, "released");
    manager.start().await;

    manager.attach_to_conversation("held", None).await.unwrap();
    manager.attach_to_conversation("released", None).await.unwrap();
    manager.detach_from_conversation("released").await;

    // One handle still attached, one sitting in the detached map; shutdown
    // must disconnect both.
    manager.stop().await;
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stop_force_disconnects_everything() {
    let runtime = Arc::new(CountingRuntime::default());
    let (manager, file_store) = manager_with(ManagerConfig::default(), Arc::clone(&runtime));
    persist_conversation(&file_store, "c1");
    manager.start().await;

    manager.attach_to_conversation("c1", None).await.unwrap();
    manager
        .maybe_start_agent_loop("c1", &SessionSettings::default(), None)
        .await
        .unwrap();

    manager.stop().await;
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 1);
    assert!(manager.get_running_agent_loops(None, None).await.is_empty());
}
