//! Task pipeline: wires the mutation engine to a live execution
//! session, with lifecycle hooks and batch semantics.

pub mod hooks;
pub mod runner;

pub use hooks::{HookError, NoHooks, TaskHooks};
pub use runner::{NodeOutput, PipelineError, Runner, TaskOutcome, TaskOutput, TaskPreparer};
