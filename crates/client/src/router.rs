//! Demultiplexing of the shared WebSocket stream into per-submission
//! event channels.
//!
//! The server multiplexes messages for every client and prompt over one
//! socket. [`EventRouter`] keeps one bounded channel per tracked prompt
//! id, translates raw [`ComfyMessage`]s into [`ExecutionEvent`]s, and
//! drops everything else. Buffering is bounded: if a consumer lags
//! behind a full channel the event is dropped with a warning rather
//! than growing memory without limit.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::events::ExecutionEvent;
use crate::messages::ComfyMessage;

/// Per-submission event buffer capacity. A workflow emits one event per
/// node plus one per sampler step; 256 comfortably covers real graphs
/// while bounding a flooded stream.
pub const EVENT_BUFFER_CAPACITY: usize = 256;

/// Routes translated events to per-prompt channels.
///
/// Routes are registered before submission (so no early event is lost)
/// and garbage-collected when a terminal event is delivered. Between
/// registration and [`activate`](Self::activate), incoming events are
/// buffered: the server can start executing before the submission HTTP
/// response (which carries the queue position) reaches us, and the
/// synthetic `Queued` event must still come first.
#[derive(Default)]
pub struct EventRouter {
    senders: HashMap<String, mpsc::Sender<ExecutionEvent>>,
    /// Receivers not yet claimed via [`take_receiver`](Self::take_receiver).
    receivers: HashMap<String, mpsc::Receiver<ExecutionEvent>>,
    /// Events that raced the submission response, flushed on activation.
    pending: HashMap<String, Vec<ExecutionEvent>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a prompt id. Must happen before the submission
    /// HTTP call returns control to the server. The route buffers
    /// events until [`activate`](Self::activate).
    pub fn register(&mut self, prompt_id: &str) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_CAPACITY);
        self.senders.insert(prompt_id.to_owned(), tx);
        self.receivers.insert(prompt_id.to_owned(), rx);
        self.pending.insert(prompt_id.to_owned(), Vec::new());
    }

    /// Deliver the synthetic `Queued` event and flush anything that
    /// arrived while the submission response was in flight. Called once
    /// the server has confirmed the submission.
    pub fn activate(&mut self, prompt_id: &str, position: i64) {
        let buffered = self.pending.remove(prompt_id).unwrap_or_default();
        self.push(prompt_id, ExecutionEvent::Queued { position });
        for event in buffered {
            self.push(prompt_id, event);
        }
    }

    /// Claim the consumer side of a tracked prompt's channel.
    ///
    /// Yields `None` if the prompt was never tracked or the receiver was
    /// already claimed — a completed, re-subscribed id gets an empty
    /// stream, not a replay.
    pub fn take_receiver(&mut self, prompt_id: &str) -> Option<mpsc::Receiver<ExecutionEvent>> {
        self.receivers.remove(prompt_id)
    }

    /// Stop tracking a prompt without delivering anything further
    /// (e.g. when the submission HTTP call failed after registration).
    pub fn deregister(&mut self, prompt_id: &str) {
        self.senders.remove(prompt_id);
        self.receivers.remove(prompt_id);
        self.pending.remove(prompt_id);
    }

    /// Number of prompts currently tracked.
    pub fn tracked(&self) -> usize {
        self.senders.len()
    }

    /// Drop every route, ending all consumer streams. Called when the
    /// connection goes away or the session closes.
    pub fn clear(&mut self) {
        self.senders.clear();
        self.receivers.clear();
        self.pending.clear();
    }

    /// Deliver an event to one tracked prompt. Untracked ids are
    /// discarded; not-yet-activated routes buffer. Terminal events
    /// remove the route afterwards.
    pub fn push(&mut self, prompt_id: &str, event: ExecutionEvent) {
        if let Some(buffer) = self.pending.get_mut(prompt_id) {
            if buffer.len() >= EVENT_BUFFER_CAPACITY {
                tracing::warn!(
                    prompt_id,
                    capacity = EVENT_BUFFER_CAPACITY,
                    ?event,
                    "Event buffer full, dropping event",
                );
            } else {
                buffer.push(event);
            }
            return;
        }

        let Some(tx) = self.senders.get(prompt_id) else {
            tracing::trace!(prompt_id, "Discarding event for untracked prompt");
            return;
        };

        let terminal = event.is_terminal();
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    prompt_id,
                    capacity = EVENT_BUFFER_CAPACITY,
                    ?event,
                    "Event buffer full, dropping event",
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(prompt_id, "Consumer gone, dropping route");
                self.senders.remove(prompt_id);
                return;
            }
        }

        if terminal {
            // Dropping the sender ends the consumer's stream after the
            // buffered events are drained.
            self.senders.remove(prompt_id);
        }
    }

    /// Translate one raw message and route it.
    pub fn handle(&mut self, msg: ComfyMessage) {
        match msg {
            ComfyMessage::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "Server queue status",
                );
            }
            ComfyMessage::ExecutionStart(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, "Execution started");
            }
            ComfyMessage::ExecutionCached(data) => {
                tracing::debug!(
                    prompt_id = %data.prompt_id,
                    cached = data.nodes.len(),
                    "Nodes served from cache",
                );
            }
            ComfyMessage::Executing(data) => {
                let event = match data.node {
                    Some(node) => ExecutionEvent::Executing { node },
                    // node == null means every node of this prompt is done.
                    None => ExecutionEvent::Completed,
                };
                self.push(&data.prompt_id, event);
            }
            ComfyMessage::Progress(data) => {
                let event = ExecutionEvent::Progress {
                    value: data.value,
                    max: data.max,
                };
                match data.prompt_id {
                    Some(prompt_id) => self.push(&prompt_id, event),
                    // Old servers omit the prompt id; with exactly one
                    // tracked submission the attribution is unambiguous.
                    None => {
                        if self.senders.len() == 1 {
                            if let Some(prompt_id) = self.senders.keys().next().cloned() {
                                self.push(&prompt_id, event);
                            }
                        }
                    }
                }
            }
            ComfyMessage::Executed(data) => {
                let event = ExecutionEvent::NodeExecuted {
                    node: data.node,
                    output: data.output,
                };
                self.push(&data.prompt_id, event);
            }
            ComfyMessage::ExecutionError(data) => {
                tracing::error!(
                    prompt_id = %data.prompt_id,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                let event = ExecutionEvent::ExecutionError {
                    node: Some(data.node_id),
                    message: data.exception_message,
                };
                self.push(&data.prompt_id, event);
            }
            ComfyMessage::ExecutionInterrupted(data) => {
                let event = ExecutionEvent::ExecutionError {
                    node: data.node_id,
                    message: "execution interrupted".to_string(),
                };
                self.push(&data.prompt_id, event);
            }
            ComfyMessage::ExecutionSuccess(data) => {
                self.push(&data.prompt_id, ExecutionEvent::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::parse_message;
    use assert_matches::assert_matches;

    fn msg(raw: &str) -> ComfyMessage {
        parse_message(raw).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn full_lifecycle_in_order() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();

        router.activate("p1", 0);
        router.handle(msg(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#));
        for step in 1..=5 {
            router.handle(
                msg(&format!(
                    r#"{{"type":"progress","data":{{"value":{step},"max":5,"prompt_id":"p1"}}}}"#
                )),
            );
        }
        router.handle(msg(
            r#"{"type":"executed","data":{"node":"9","output":{"images":[]},"prompt_id":"p1"}}"#,
        ));
        router.handle(msg(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 9);
        assert_matches!(events[0], ExecutionEvent::Queued { position: 0 });
        assert_matches!(events[1], ExecutionEvent::Executing { .. });
        assert_eq!(events[2], ExecutionEvent::Progress { value: 1, max: 5 });
        assert_eq!(events[6], ExecutionEvent::Progress { value: 5, max: 5 });
        assert_matches!(events[7], ExecutionEvent::NodeExecuted { .. });
        assert_eq!(events[8], ExecutionEvent::Completed);

        // stream is finished: sender dropped, nothing follows
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn interleaved_foreign_prompts_are_invisible() {
        let mut router = EventRouter::new();
        router.register("mine");
        let mut rx = router.take_receiver("mine").unwrap();
        router.activate("mine", 1);

        router.handle(msg(r#"{"type":"executing","data":{"node":"1","prompt_id":"mine"}}"#));
        router.handle(msg(r#"{"type":"executing","data":{"node":"8","prompt_id":"theirs"}}"#));
        router.handle(msg(
            r#"{"type":"progress","data":{"value":1,"max":2,"prompt_id":"theirs"}}"#,
        ));
        router.handle(msg(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ExecutionEvent::Queued { position: 1 },
                ExecutionEvent::Executing { node: "1".into() },
                ExecutionEvent::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn no_events_after_terminal() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();
        router.activate("p1", 0);

        router.handle(msg(r#"{"type":"execution_success","data":{"prompt_id":"p1"}}"#));
        // late messages for a completed prompt are discarded
        router.handle(msg(r#"{"type":"executing","data":{"node":"4","prompt_id":"p1"}}"#));

        assert_eq!(
            drain(&mut rx),
            vec![
                ExecutionEvent::Queued { position: 0 },
                ExecutionEvent::Completed,
            ]
        );
        assert_eq!(router.tracked(), 0);
    }

    #[tokio::test]
    async fn error_is_terminal_and_carries_diagnostics() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();
        router.activate("p1", 0);

        router.handle(msg(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"5","exception_message":"out of memory","exception_type":"RuntimeError"}}"#,
        ));

        let events = drain(&mut rx);
        assert_matches!(
            &events[..],
            [
                ExecutionEvent::Queued { position: 0 },
                ExecutionEvent::ExecutionError { node: Some(node), message },
            ]
                if node == "5" && message == "out of memory"
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn interrupted_maps_to_execution_error() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();
        router.activate("p1", 0);

        router.handle(msg(
            r#"{"type":"execution_interrupted","data":{"prompt_id":"p1","node_id":"2"}}"#,
        ));

        assert_matches!(
            &drain(&mut rx)[..],
            [
                ExecutionEvent::Queued { .. },
                ExecutionEvent::ExecutionError { .. },
            ]
        );
    }

    #[tokio::test]
    async fn untagged_progress_goes_to_sole_tracked_prompt() {
        let mut router = EventRouter::new();
        router.register("only");
        let mut rx = router.take_receiver("only").unwrap();
        router.activate("only", 0);

        router.handle(msg(r#"{"type":"progress","data":{"value":2,"max":4}}"#));
        assert_eq!(
            drain(&mut rx),
            vec![
                ExecutionEvent::Queued { position: 0 },
                ExecutionEvent::Progress { value: 2, max: 4 },
            ]
        );
    }

    #[tokio::test]
    async fn untagged_progress_with_multiple_prompts_is_discarded() {
        let mut router = EventRouter::new();
        router.register("a");
        router.register("b");
        let mut rx_a = router.take_receiver("a").unwrap();
        let mut rx_b = router.take_receiver("b").unwrap();
        router.activate("a", 0);
        router.activate("b", 1);

        router.handle(msg(r#"{"type":"progress","data":{"value":2,"max":4}}"#));
        assert_eq!(drain(&mut rx_a), vec![ExecutionEvent::Queued { position: 0 }]);
        assert_eq!(drain(&mut rx_b), vec![ExecutionEvent::Queued { position: 1 }]);
    }

    #[tokio::test]
    async fn full_buffer_drops_events_without_growing() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();
        router.activate("p1", 0);

        for i in 0..(EVENT_BUFFER_CAPACITY + 50) {
            router.push(
                "p1",
                ExecutionEvent::Progress {
                    value: i as i64,
                    max: 1000,
                },
            );
        }

        assert_eq!(drain(&mut rx).len(), EVENT_BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn frames_racing_the_submission_response_follow_queued() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();

        // the server starts executing before the HTTP response arrives
        router.handle(msg(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#));
        router.handle(msg(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#));
        assert!(drain(&mut rx).is_empty());

        router.activate("p1", 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                ExecutionEvent::Queued { position: 2 },
                ExecutionEvent::Executing { node: "3".into() },
            ]
        );
    }

    #[tokio::test]
    async fn terminal_frame_racing_activation_still_follows_queued() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();

        router.handle(msg(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"1","exception_message":"bad input","exception_type":"ValueError"}}"#,
        ));
        router.activate("p1", 0);

        assert_matches!(
            &drain(&mut rx)[..],
            [
                ExecutionEvent::Queued { position: 0 },
                ExecutionEvent::ExecutionError { .. },
            ]
        );
        assert!(rx.recv().await.is_none());
        assert_eq!(router.tracked(), 0);
    }

    #[tokio::test]
    async fn pending_buffer_is_bounded() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();

        for i in 0..(EVENT_BUFFER_CAPACITY + 50) {
            router.push(
                "p1",
                ExecutionEvent::Progress {
                    value: i as i64,
                    max: 1000,
                },
            );
        }
        router.activate("p1", 0);

        assert_eq!(drain(&mut rx).len(), EVENT_BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn take_receiver_only_once() {
        let mut router = EventRouter::new();
        router.register("p1");
        assert!(router.take_receiver("p1").is_some());
        assert!(router.take_receiver("p1").is_none());
        assert!(router.take_receiver("never-registered").is_none());
    }

    #[tokio::test]
    async fn clear_ends_consumer_streams() {
        let mut router = EventRouter::new();
        router.register("p1");
        let mut rx = router.take_receiver("p1").unwrap();
        router.clear();
        assert!(rx.recv().await.is_none());
    }
}
