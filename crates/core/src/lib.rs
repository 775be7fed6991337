//! Core domain types for driving a ComfyUI server.
//!
//! Pure, I/O-free building blocks: the job graph model, node selection,
//! declarative value resolution, and the workflow mutator with its seed
//! randomization policy. Everything here is deterministic given an
//! injected RNG, which keeps the mutation engine testable under a
//! seeded generator.

pub mod graph;
pub mod mutator;
pub mod resolver;
pub mod selector;
pub mod task;
pub mod value;

pub use graph::{JobGraph, NodeSpec};
pub use mutator::{mutate, MutateError, Mutation, SeedPolicy, MAX_SEED};
pub use resolver::{resolve, ResolveError, ValueRegistry};
pub use selector::{select, NodeSelector, SelectError};
pub use task::{ConfigError, TaskDescription};
pub use value::ValueSpec;
