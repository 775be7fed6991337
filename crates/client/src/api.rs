//! REST client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, queue status, history retrieval, and
//! interruption using [`reqwest`]. Server rejections keep the raw
//! response body so callers can diagnose bad workflows.

use comfyrun_core::JobGraph;
use serde::Deserialize;

use crate::config::ServerConfig;

/// HTTP client for a single ComfyUI server.
pub struct ComfyApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response from `POST /prompt` after successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Identifier of the queued prompt (echoes the client-supplied one).
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    /// Per-node validation errors. Non-empty means the workflow was
    /// accepted only partially and should be treated as rejected.
    #[serde(default)]
    pub node_errors: serde_json::Map<String, serde_json::Value>,
}

/// Response from `GET /queue`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueInfo {
    /// Total outstanding work: running plus pending entries.
    pub fn depth(&self) -> usize {
        self.queue_running.len() + self.queue_pending.len()
    }
}

/// Errors from the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("server error ({status}): {body}")]
    Server {
        status: u16,
        /// Raw response body, preserved for diagnostics.
        body: String,
    },
}

impl ComfyApi {
    /// Create an API client for the configured server.
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
        })
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the graph, the WebSocket client id
    /// (so execution messages are addressed back to our stream), and a
    /// client-generated prompt id used to correlate those messages.
    pub async fn submit_prompt(
        &self,
        graph: &JobGraph,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<SubmitResponse, ApiError> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
            "prompt_id": prompt_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Current queue state (`GET /queue`).
    pub async fn queue_info(&self) -> Result<QueueInfo, ApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Execution history for one prompt (`GET /history/{prompt_id}`).
    ///
    /// The returned JSON carries output file references, node results,
    /// and timing data.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_counts_running_and_pending() {
        let info: QueueInfo = serde_json::from_str(
            r#"{"queue_running": [[0, "a"]], "queue_pending": [[1, "b"], [2, "c"]]}"#,
        )
        .unwrap();
        assert_eq!(info.depth(), 3);
    }

    #[test]
    fn queue_info_tolerates_missing_lists() {
        let info: QueueInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(info.depth(), 0);
    }

    #[test]
    fn submit_response_without_node_errors() {
        let resp: SubmitResponse =
            serde_json::from_str(r#"{"prompt_id": "abc", "number": 4}"#).unwrap();
        assert_eq!(resp.prompt_id, "abc");
        assert_eq!(resp.number, 4);
        assert!(resp.node_errors.is_empty());
    }

    #[test]
    fn submit_response_with_node_errors() {
        let resp: SubmitResponse = serde_json::from_str(
            r#"{"prompt_id": "abc", "number": 0, "node_errors": {"3": {"errors": []}}}"#,
        )
        .unwrap();
        assert!(!resp.node_errors.is_empty());
    }
}
