//! Error types for EventLoom
//!
//! This module defines all error types used throughout the EventLoom core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

/// The primary error type for EventLoom operations.
#[derive(Error, Debug)]
pub enum LoomError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An event with an already-assigned id was re-submitted to a stream.
    ///
    /// This is a programmer error: it almost always means an event was added
    /// back to the stream from inside a subscriber callback, creating a
    /// feedback loop.
    #[error("Event already has an id ({0}) - it was probably added back to the stream from inside a handler, triggering a loop")]
    FeedbackLoop(i64),

    /// A callback id was registered twice under the same subscriber kind.
    #[error("Callback id '{callback_id}' already registered for subscriber '{subscriber}'")]
    DuplicateCallback {
        /// The subscriber category the registration targeted
        subscriber: String,
        /// The offending callback id
        callback_id: String,
    },

    /// Event stream errors (persistence failures, malformed records, etc.)
    #[error("Stream error: {0}")]
    Stream(String),

    /// Broker errors (publish failures, consumer disconnects, etc.)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Session management errors (invalid state, loop startup failures, etc.)
    #[error("Session error: {0}")]
    Session(String),

    /// Condenser pipeline errors (summarization failures under the Fail policy)
    #[error("Condenser error: {0}")]
    Condenser(String),

    /// The conversation runtime could not be reached during attach.
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Resource not found (sessions, events, conversations, etc.)
    ///
    /// Distinct from an empty history: `NotFound` means storage has no record
    /// of the session at all.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for EventLoom operations.
pub type Result<T> = std::result::Result<T, LoomError>;
