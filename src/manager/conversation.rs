//! Conversation handles and the runtime contract.
//!
//! A [`Conversation`] is the client-facing handle to a session's surrounding
//! resources. The manager keeps one per sid and hands out the same `Arc` to
//! every attached client, so handle identity survives detach and reattach
//! within the grace period.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// The execution environment backing a conversation (sandbox, browser, ...).
///
/// `connect` is called when a conversation handle is first constructed;
/// `disconnect` when the handle is evicted. Both may be called more than once
/// over a handle's life (reattach after eviction builds a new handle).
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Runtime for deployments with no external execution environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRuntime;

#[async_trait]
impl Runtime for NoopRuntime {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Client-facing handle to one conversation.
pub struct Conversation {
    pub sid: String,
    pub user_id: Option<String>,
    runtime: Arc<dyn Runtime>,
}

impl Conversation {
    pub fn new(sid: &str, user_id: Option<&str>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            sid: sid.to_string(),
            user_id: user_id.map(str::to_string),
            runtime,
        }
    }

    /// Connect the backing runtime.
    pub async fn connect(&self) -> Result<()> {
        self.runtime.connect().await
    }

    /// Disconnect the backing runtime.
    pub async fn disconnect(&self) -> Result<()> {
        self.runtime.disconnect().await
    }
}
