//! The execution session: one scoped connection to one ComfyUI server.
//!
//! [`Session::connect`] opens the WebSocket (with a fresh client id so
//! the server addresses execution messages to us) and spawns a single
//! background reader that feeds the [`EventRouter`]. Submissions go out
//! over HTTP with a client-generated prompt id; the matching event
//! route is registered before the HTTP call so no early message is
//! lost, and frames that race the response are buffered behind the
//! synthetic `Queued` event. `close` cancels the reader on every exit
//! path and unblocks any consumer still waiting on a stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use comfyrun_core::JobGraph;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, ComfyApi};
use crate::config::ServerConfig;
use crate::events::ExecutionEvent;
use crate::messages::parse_message;
use crate::router::EventRouter;

/// How long `close` waits for the reader task to exit cleanly.
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `submit`/`events` called after `close`. Lifecycle misuse.
    #[error("session is closed")]
    Closed,

    /// The WebSocket connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The submission HTTP call failed; the server's payload (if any)
    /// is preserved inside.
    #[error("submission failed: {0}")]
    Submit(#[source] ApiError),

    /// A non-submission REST call (history, interrupt) failed.
    #[error("server request failed: {0}")]
    Api(#[from] ApiError),

    /// The server accepted the request but reported per-node validation
    /// errors (unknown class identifier, bad link, ...).
    #[error("workflow rejected by server: {0}")]
    Rejected(String),
}

/// A live session with one ComfyUI server.
pub struct Session {
    api: ComfyApi,
    client_id: String,
    router: Arc<Mutex<EventRouter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Open the WebSocket and start the background reader.
    pub async fn connect(config: &ServerConfig) -> Result<Self, SessionError> {
        let api = ComfyApi::new(config).map_err(|e| SessionError::Connect(e.to_string()))?;
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", config.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            SessionError::Connect(format!("failed to connect to {}: {e}", config.ws_url))
        })?;

        tracing::info!(
            client_id = %client_id,
            ws_url = %config.ws_url,
            "Connected to ComfyUI",
        );

        let router = Arc::new(Mutex::new(EventRouter::new()));
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            ws_stream,
            Arc::clone(&router),
            cancel.clone(),
        ));

        Ok(Self {
            api,
            client_id,
            router,
            reader: Mutex::new(Some(reader)),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Submit a fully-resolved graph for execution.
    ///
    /// Returns the prompt id used to correlate the event stream. The
    /// graph is taken by value; the session never mutates it.
    pub async fn submit(&self, graph: JobGraph) -> Result<String, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let prompt_id = uuid::Uuid::new_v4().to_string();

        // Register before the HTTP call: execution can start (and emit
        // messages) before the response reaches us.
        self.router.lock().await.register(&prompt_id);

        let response = match self
            .api
            .submit_prompt(&graph, &self.client_id, &prompt_id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.router.lock().await.deregister(&prompt_id);
                return Err(SessionError::Submit(e));
            }
        };

        if !response.node_errors.is_empty() {
            self.router.lock().await.deregister(&prompt_id);
            let detail = serde_json::Value::Object(response.node_errors).to_string();
            return Err(SessionError::Rejected(detail));
        }

        // Delivers the synthetic Queued event first, then any frames
        // that raced the HTTP response.
        self.router
            .lock()
            .await
            .activate(&prompt_id, response.number);

        tracing::info!(
            prompt_id = %prompt_id,
            position = response.number,
            "Workflow submitted",
        );

        Ok(prompt_id)
    }

    /// The event stream for one submission.
    ///
    /// Lazy and finite: it ends after a terminal event. A prompt id
    /// that is unknown, already consumed, or already completed yields
    /// an empty stream.
    pub async fn events(&self, prompt_id: &str) -> Result<EventStream, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let rx = self.router.lock().await.take_receiver(prompt_id);
        Ok(match rx {
            Some(rx) => EventStream::new(rx),
            None => EventStream::empty(),
        })
    }

    /// Fetch the final outputs recorded for a prompt from the server's
    /// history endpoint.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        Ok(self.api.history(prompt_id).await?)
    }

    /// Ask the server to interrupt whatever is executing right now. The
    /// affected submission's stream ends with an execution error event.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        Ok(self.api.interrupt().await?)
    }

    /// Close the session, releasing the transport.
    ///
    /// Idempotent. Any consumer blocked on an event stream is unblocked
    /// with end-of-stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(client_id = %self.client_id, "Closing session");
        self.cancel.cancel();
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, handle).await;
        }
        self.router.lock().await.clear();
    }

    #[cfg(test)]
    fn stub(config: &ServerConfig) -> Self {
        Self {
            api: ComfyApi::new(config).expect("client builder"),
            client_id: "test-client".into(),
            router: Arc::new(Mutex::new(EventRouter::new())),
            reader: Mutex::new(Some(tokio::spawn(async {}))),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stops the reader even if close() was never awaited.
        self.cancel.cancel();
    }
}

/// Reads frames until the socket closes, a fatal receive error occurs,
/// or the session is cancelled. Binary frames carry preview images and
/// are ignored.
async fn read_loop(
    mut ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    router: Arc<Mutex<EventRouter>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Reader cancelled");
                break;
            }
            frame = ws_stream.next() => frame,
        };

        match frame {
            None => {
                tracing::info!("WebSocket stream ended");
                break;
            }
            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                Ok(msg) => router.lock().await.handle(msg),
                Err(e) => {
                    // Unknown message types are non-fatal; the server
                    // emits extension messages we do not track.
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Unrecognized server message, skipping",
                    );
                }
            },
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "WebSocket closed by server");
                break;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Ends every consumer stream, including on cancellation.
    router.lock().await.clear();
}

/// A lazy, finite stream of [`ExecutionEvent`]s for one submission.
#[derive(Debug)]
pub struct EventStream {
    rx: Option<mpsc::Receiver<ExecutionEvent>>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<ExecutionEvent>) -> Self {
        Self { rx: Some(rx) }
    }

    pub(crate) fn empty() -> Self {
        Self { rx: None }
    }

    /// Await the next event. `None` means the submission reached a
    /// terminal state or the session was closed.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Stream for EventStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.rx {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> ServerConfig {
        ServerConfig::from_host("127.0.0.1:18188")
    }

    #[tokio::test]
    async fn closed_session_rejects_submit_and_events() {
        let session = Session::stub(&config());
        session.close().await;

        let err = session.submit(JobGraph::new()).await.unwrap_err();
        assert_matches!(err, SessionError::Closed);

        let err = session.events("anything").await.unwrap_err();
        assert_matches!(err, SessionError::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = Session::stub(&config());
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_prompt_yields_empty_stream() {
        let session = Session::stub(&config());
        let mut stream = session.events("no-such-prompt").await.unwrap();
        assert!(stream.next().await.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn closing_unblocks_a_waiting_consumer() {
        let session = Arc::new(Session::stub(&config()));
        session.router.lock().await.register("p1");
        let mut stream = session.events("p1").await.unwrap();

        let closer = Arc::clone(&session);
        let waiter = tokio::spawn(async move { stream.next().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("consumer must unblock on close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn buffered_events_drain_before_end_of_stream() {
        let session = Session::stub(&config());
        {
            let mut router = session.router.lock().await;
            router.register("p1");
            router.activate("p1", 2);
            router.push("p1", ExecutionEvent::Completed);
        }

        let mut stream = session.events("p1").await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(ExecutionEvent::Queued { position: 2 })
        );
        assert_eq!(stream.next().await, Some(ExecutionEvent::Completed));
        assert!(stream.next().await.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn resubscribing_yields_empty_stream() {
        let session = Session::stub(&config());
        session.router.lock().await.register("p1");
        let _first = session.events("p1").await.unwrap();
        let mut second = session.events("p1").await.unwrap();
        assert!(second.next().await.is_none());
        session.close().await;
    }
}
