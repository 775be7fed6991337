//! ComfyUI client library: REST submission, WebSocket event streaming,
//! and queue-depth backpressure.
//!
//! One [`session::Session`] owns one connection to one ComfyUI server.
//! Submitted workflows are tracked by prompt id; the shared WebSocket
//! stream is demultiplexed into per-submission typed event streams.

pub mod api;
pub mod backoff;
pub mod config;
pub mod events;
pub mod messages;
pub mod queue;
pub mod router;
pub mod session;

pub use api::{ApiError, ComfyApi, QueueInfo, SubmitResponse};
pub use backoff::BackoffConfig;
pub use config::ServerConfig;
pub use events::ExecutionEvent;
pub use queue::{QueueController, QueueError, QueuePolicy, QueueStatusSource};
pub use session::{EventStream, Session, SessionError};
