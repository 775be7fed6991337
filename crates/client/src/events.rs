//! Typed per-submission execution events.
//!
//! These are what consumers of an event stream see: raw WebSocket
//! messages are filtered by prompt id and folded into this lifecycle by
//! the [`crate::router`]. Order per submission is strict:
//! `Queued → Executing (Progress / NodeExecuted interleaved) →
//! {Completed | ExecutionError}`, and nothing follows a terminal event.

use serde::Serialize;

/// A lifecycle event for one tracked submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionEvent {
    /// The workflow was accepted and queued at this position.
    Queued { position: i64 },

    /// A node began executing.
    Executing { node: String },

    /// Step-level progress within the currently executing node.
    Progress { value: i64, max: i64 },

    /// A node finished and produced output (images, filenames, etc.).
    NodeExecuted {
        node: String,
        output: serde_json::Value,
    },

    /// Execution failed. Terminal.
    ExecutionError {
        node: Option<String>,
        message: String,
    },

    /// Execution finished successfully. Terminal.
    Completed,
}

impl ExecutionEvent {
    /// Whether this event ends the submission's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecutionError { .. } | Self::Completed)
    }
}
