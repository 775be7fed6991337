//! The task runner: wires the mutation engine to a live session.
//!
//! One [`Runner`] owns one session and processes one task at a time:
//! hook veto, graph preparation, queue admission, submission, event
//! consumption, post-completion hook. Server-side execution failures
//! are recorded in the task output rather than raised, so a batch keeps
//! going when one task's workflow blows up on the GPU.

use comfyrun_core::task::PREVIEW_CLASS;
use comfyrun_core::{mutate, ConfigError, JobGraph, MutateError, SeedPolicy, TaskDescription, ValueRegistry};
use comfyrun_client::{
    ComfyApi, ExecutionEvent, QueueController, QueueError, QueuePolicy, ServerConfig, Session,
    SessionError,
};
use futures::{Stream, StreamExt};
use rand::RngCore;
use serde::Serialize;

use crate::hooks::{HookError, NoHooks, TaskHooks};

/// Errors that abort a single task run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The task description failed validation; nothing was submitted.
    #[error("invalid task: {0}")]
    Config(#[from] ConfigError),

    /// A mutation could not be applied; nothing was submitted.
    #[error(transparent)]
    Mutate(#[from] MutateError),

    /// Queue admission failed. Aborts the whole batch, not just the
    /// current task: the server is unreachable or permanently busy.
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: &'static str,
        #[source]
        source: HookError,
    },
}

/// Output produced by one node during execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutput {
    pub node: String,
    /// Raw output payload (image references, filenames, ...).
    pub output: serde_json::Value,
}

/// Everything one finished task run produced.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub prompt_id: String,
    /// Outputs in the order nodes finished.
    pub outputs: Vec<NodeOutput>,
    /// Set when the server reported a terminal execution error. The
    /// error is part of the result, not a Rust error: the submission
    /// itself succeeded.
    pub error: Option<String>,
}

impl TaskOutput {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// How one task run ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The pre-submission hook vetoed the task.
    Skipped,
    /// The task ran to a terminal event (success or execution error).
    Finished(TaskOutput),
}

/// Turns a task description into a submittable graph.
///
/// Pure and network-free: validation, preview stripping, mutation. Kept
/// separate from [`Runner`] so it is testable without a server.
pub struct TaskPreparer {
    registry: ValueRegistry,
    seed_policy: SeedPolicy,
}

impl Default for TaskPreparer {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPreparer {
    pub fn new() -> Self {
        Self {
            registry: ValueRegistry::new(),
            seed_policy: SeedPolicy::default(),
        }
    }

    /// Use a registry with custom value-type handlers.
    pub fn with_registry(mut self, registry: ValueRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_seed_policy(mut self, policy: SeedPolicy) -> Self {
        self.seed_policy = policy;
        self
    }

    /// Validate, strip preview nodes if requested, and mutate.
    pub fn prepare(
        &self,
        task: &TaskDescription,
        rng: &mut dyn RngCore,
    ) -> Result<JobGraph, PipelineError> {
        task.validate()?;

        let mut template = task.graph.clone();
        if task.strip_previews {
            let removed = template.remove_nodes_of_class(PREVIEW_CLASS);
            if removed > 0 {
                tracing::debug!(removed, "Stripped preview nodes");
            }
        }

        let graph = mutate(
            &template,
            &task.mutations,
            &self.seed_policy,
            &self.registry,
            rng,
        )?;
        Ok(graph)
    }
}

/// Drives tasks against one ComfyUI server.
pub struct Runner<H = NoHooks> {
    session: Session,
    queue: QueueController<ComfyApi>,
    preparer: TaskPreparer,
    hooks: H,
}

impl Runner<NoHooks> {
    /// Connect to the server and build a runner with default hooks.
    pub async fn connect(
        config: &ServerConfig,
        queue_policy: QueuePolicy,
    ) -> Result<Self, PipelineError> {
        let session = Session::connect(config).await?;
        let api = ComfyApi::new(config)
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        Ok(Self {
            session,
            queue: QueueController::new(api, queue_policy),
            preparer: TaskPreparer::new(),
            hooks: NoHooks,
        })
    }
}

impl<H: TaskHooks> Runner<H> {
    /// Replace the hook set.
    pub fn with_hooks<H2: TaskHooks>(self, hooks: H2) -> Runner<H2> {
        Runner {
            session: self.session,
            queue: self.queue,
            preparer: self.preparer,
            hooks,
        }
    }

    /// Replace the task preparer (custom value registry, seed policy).
    pub fn with_preparer(mut self, preparer: TaskPreparer) -> Self {
        self.preparer = preparer;
        self
    }

    /// Run one task to its terminal event.
    pub async fn run(&self, task: &TaskDescription) -> Result<TaskOutcome, PipelineError> {
        let admitted = self
            .hooks
            .pre_submit(task)
            .await
            .map_err(|source| PipelineError::Hook {
                stage: "pre_submit",
                source,
            })?;
        if !admitted {
            tracing::info!("Task vetoed by pre-submission hook, skipping");
            return Ok(TaskOutcome::Skipped);
        }

        // ThreadRng is not Send; keep it out of the await scope.
        let mut graph = {
            let mut rng = rand::rng();
            self.preparer.prepare(task, &mut rng)?
        };

        self.hooks
            .modify_graph(&mut graph)
            .await
            .map_err(|source| PipelineError::Hook {
                stage: "modify_graph",
                source,
            })?;

        let depth = self.queue.wait_for_capacity().await?;
        tracing::debug!(depth, "Admitted by queue controller");

        let prompt_id = self.session.submit(graph).await?;
        let stream = self.session.events(&prompt_id).await?;
        let output = collect_outputs(&prompt_id, stream).await;

        self.hooks
            .post_complete(&output)
            .await
            .map_err(|source| PipelineError::Hook {
                stage: "post_complete",
                source,
            })?;

        Ok(TaskOutcome::Finished(output))
    }

    /// Run tasks sequentially.
    ///
    /// Per-task failures (bad config, failed mutation, server
    /// rejection) are recorded and the batch continues. Queue admission
    /// failure aborts the batch: every remaining task would hit the
    /// same wall.
    pub async fn run_batch(
        &self,
        tasks: &[TaskDescription],
    ) -> Result<Vec<Result<TaskOutcome, PipelineError>>, PipelineError> {
        let mut results = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            match self.run(task).await {
                Ok(outcome) => results.push(Ok(outcome)),
                Err(PipelineError::Queue(e)) => return Err(PipelineError::Queue(e)),
                Err(e) => {
                    tracing::error!(index, error = %e, "Task failed, continuing batch");
                    results.push(Err(e));
                }
            }
        }

        Ok(results)
    }

    /// Close the underlying session.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Fold an event stream into a [`TaskOutput`].
///
/// Consumes the stream to exhaustion; a terminal execution error is
/// recorded, not raised.
async fn collect_outputs<S>(prompt_id: &str, mut stream: S) -> TaskOutput
where
    S: Stream<Item = ExecutionEvent> + Unpin,
{
    let mut outputs = Vec::new();
    let mut error = None;

    while let Some(event) = stream.next().await {
        match event {
            ExecutionEvent::Queued { position } => {
                tracing::info!(prompt_id, position, "Task queued");
            }
            ExecutionEvent::Executing { node } => {
                tracing::debug!(prompt_id, node = %node, "Node executing");
            }
            ExecutionEvent::Progress { value, max } => {
                tracing::trace!(prompt_id, value, max, "Progress");
            }
            ExecutionEvent::NodeExecuted { node, output } => {
                outputs.push(NodeOutput { node, output });
            }
            ExecutionEvent::ExecutionError { node, message } => {
                tracing::error!(prompt_id, node = ?node, message = %message, "Execution failed");
                error = Some(message);
            }
            ExecutionEvent::Completed => {
                tracing::info!(prompt_id, outputs = outputs.len(), "Execution completed");
            }
        }
    }

    TaskOutput {
        prompt_id: prompt_id.to_owned(),
        outputs,
        error,
    }
}
