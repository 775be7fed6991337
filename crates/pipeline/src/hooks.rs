//! Task lifecycle hooks.
//!
//! Callers customize a run by implementing [`TaskHooks`]: veto a task
//! before any work happens, adjust the mutated graph right before
//! submission, or react to the collected outputs afterwards. Every
//! method has a no-op default, so implementors override only what they
//! need.

use async_trait::async_trait;
use comfyrun_core::{JobGraph, TaskDescription};

use crate::runner::TaskOutput;

/// A hook implementation signalled failure. The message is whatever the
/// implementor put there; the runner wraps it with the hook stage name.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Lifecycle hooks around a single task run.
#[async_trait]
pub trait TaskHooks: Send + Sync {
    /// Runs before anything else. Return `Ok(false)` to skip the task
    /// entirely; nothing is mutated or submitted.
    async fn pre_submit(&self, _task: &TaskDescription) -> Result<bool, HookError> {
        Ok(true)
    }

    /// Runs on the fully-mutated graph just before submission. The hook
    /// may inspect or alter it in place.
    async fn modify_graph(&self, _graph: &mut JobGraph) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs after the event stream is exhausted, with everything the
    /// execution produced. Also called when the execution itself failed
    /// (`output.error` is set).
    async fn post_complete(&self, _output: &TaskOutput) -> Result<(), HookError> {
        Ok(())
    }
}

/// The do-nothing hook set.
pub struct NoHooks;

#[async_trait]
impl TaskHooks for NoHooks {}
