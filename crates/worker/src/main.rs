//! Worker binary: reads a task description file, runs it against the
//! configured ComfyUI server, and logs a summary.
//!
//! Configuration comes from the environment (`.env` supported):
//! `COMFYRUN_HOST` is the server's `host:port`. The single positional
//! argument is a JSON file holding one task description or an array of
//! them.

use anyhow::Context;
use comfyrun_client::{QueuePolicy, ServerConfig};
use comfyrun_core::TaskDescription;
use comfyrun_pipeline::{Runner, TaskOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyrun_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let host = std::env::var("COMFYRUN_HOST").unwrap_or_else(|_| "127.0.0.1:8188".into());
    let task_path = std::env::args()
        .nth(1)
        .context("usage: comfyrun-worker <task.json>")?;

    let raw = tokio::fs::read_to_string(&task_path)
        .await
        .with_context(|| format!("reading task file {task_path}"))?;
    let tasks = parse_tasks(&raw)?;

    let config = ServerConfig::from_host(&host);
    tracing::info!(host = %host, tasks = tasks.len(), "Worker starting");

    let runner = Runner::connect(&config, QueuePolicy::default()).await?;
    let results = runner.run_batch(&tasks).await;
    runner.close().await;
    let results = results?;

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for (index, result) in results.iter().enumerate() {
        match result {
            Ok(TaskOutcome::Finished(output)) if output.succeeded() => {
                succeeded += 1;
                for out in &output.outputs {
                    tracing::info!(index, node = %out.node, "Output produced");
                }
            }
            Ok(TaskOutcome::Finished(output)) => {
                failed += 1;
                tracing::warn!(
                    index,
                    error = output.error.as_deref().unwrap_or("unknown"),
                    "Task failed on server",
                );
            }
            Ok(TaskOutcome::Skipped) => skipped += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(index, error = %e, "Task aborted");
            }
        }
    }

    tracing::info!(succeeded, failed, skipped, "Worker finished");
    if failed > 0 {
        anyhow::bail!("{failed} task(s) failed");
    }
    Ok(())
}

/// Accepts either a single task description or an array of them.
fn parse_tasks(raw: &str) -> anyhow::Result<Vec<TaskDescription>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("task file is not valid JSON")?;
    let tasks = if value.is_array() {
        serde_json::from_value(value).context("invalid task list")?
    } else {
        vec![serde_json::from_value(value).context("invalid task description")?]
    };
    Ok(tasks)
}
