use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type a worker's `init` and `process` implementations may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Diagnostic record of a worker-side failure.
///
/// When a worker's transform fails, the error is wrapped together with the
/// originating stage name, the offending task and a backtrace captured on the
/// worker thread. The record travels through the graph as a poison token and
/// surfaces at the caller with its original context intact, even when it
/// crossed several tubes on the way.
#[derive(Debug, Clone)]
pub struct WorkError {
    stage: String,
    worker: Option<usize>,
    offending_task: Option<String>,
    message: String,
    backtrace: Arc<str>,
}

impl WorkError {
    fn capture(
        stage: &str,
        worker: Option<usize>,
        offending_task: Option<String>,
        message: String,
    ) -> Self {
        WorkError {
            stage: stage.to_owned(),
            worker,
            offending_task,
            message,
            backtrace: Backtrace::force_capture().to_string().into(),
        }
    }

    /// Wrap a failed transform together with the task it choked on.
    pub(crate) fn task(
        stage: &str,
        worker: usize,
        task: &dyn fmt::Debug,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self::capture(
            stage,
            Some(worker),
            Some(format!("{task:?}")),
            err.to_string(),
        )
    }

    /// Wrap a failure of the worker's one-time initialization.
    pub(crate) fn during_init(stage: &str, worker: usize, message: String) -> Self {
        Self::capture(stage, Some(worker), None, format!("init failed: {message}"))
    }

    /// Wrap a panic that unwound out of the worker's transform.
    pub(crate) fn panicked(
        stage: &str,
        worker: usize,
        task: &dyn fmt::Debug,
        message: String,
    ) -> Self {
        Self::capture(
            stage,
            Some(worker),
            Some(format!("{task:?}")),
            format!("panicked: {message}"),
        )
    }

    /// Wrap an input tube that disconnected before a stop token arrived.
    pub(crate) fn transport(stage: &str, worker: usize) -> Self {
        Self::capture(
            stage,
            Some(worker),
            None,
            "input tube closed before a stop token arrived".to_owned(),
        )
    }

    /// Wrap a leaf stage whose workers vanished without emitting a stop token.
    pub(crate) fn lost(stage: &str) -> Self {
        Self::capture(
            stage,
            None,
            None,
            "stage went away without sending a stop token".to_owned(),
        )
    }

    /// Name of the stage the failure originated in.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Index of the worker within its stage, if the failure happened inside one.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    /// `Debug` rendering of the task the worker was processing when it failed.
    pub fn offending_task(&self) -> Option<&str> {
        self.offending_task.as_deref()
    }

    /// Display text of the original error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace captured on the worker thread at the moment of failure.
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage `{}`", self.stage)?;
        if let Some(worker) = self.worker {
            write!(f, " worker {worker}")?;
        }
        if let Some(task) = &self.offending_task {
            write!(f, " failed on task {task}: {}", self.message)
        } else {
            write!(f, " failed: {}", self.message)
        }
    }
}

impl std::error::Error for WorkError {}

/// Misassembled or misused stage graphs.
///
/// All variants are raised synchronously at construction or call time,
/// before (or instead of) any worker seeing a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphMisuse {
    /// A stage cannot feed its own input tube.
    #[error("cannot link stage `{0}` to itself")]
    SelfLink(String),
    /// The downstream stage already has an upstream writer (an input tube has
    /// exactly one writer interface).
    #[error("stage `{0}` already has an upstream stage linked to it")]
    AlreadyLinked(String),
    /// `build` ran twice, for example because a stage handle was passed to two
    /// pipelines.
    #[error("stage `{0}` is already built")]
    AlreadyBuilt(String),
    /// The stage graph is not a DAG.
    #[error("stage graph contains a cycle through `{0}`")]
    Cycle(String),
    /// Ordered result delivery needs a single leaf to re-sequence from.
    #[error("ordered results require exactly one leaf stage, this graph has {0}")]
    MultipleLeavesNotOrdered(usize),
    /// A stage with an empty worker pool can never drain its input.
    #[error("stage `{0}` needs at least one worker")]
    ZeroWorkers(String),
    /// A bounded tube needs room for at least one envelope.
    #[error("stage `{0}`: max_backlog must be at least 1")]
    InvalidBacklog(String),
    /// No further input is admitted once the stop token entered the graph.
    #[error("cannot put a task after stop")]
    PutAfterStop,
}

/// Everything that can go wrong while assembling or driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A worker transform failed somewhere in the graph; carries the original
    /// diagnostic context.
    #[error(transparent)]
    Task(#[from] WorkError),
    /// `get` timed out before any leaf produced a result. The pipeline keeps
    /// running; the call may simply be retried.
    #[error("timed out waiting for a result")]
    Timeout,
    /// The graph was assembled or used incorrectly.
    #[error(transparent)]
    Graph(#[from] GraphMisuse),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread for stage `{stage}`")]
    Spawn {
        /// Stage the worker belongs to.
        stage: String,
        /// Underlying spawn failure.
        #[source]
        source: std::io::Error,
    },
    /// A stage asked for blocking-pool workers outside a tokio runtime.
    #[error("stage `{0}` uses the blocking pool but no tokio runtime is running")]
    NoRuntime(String),
    /// The pipeline's ingest side is gone; the graph has already torn down.
    #[error("pipeline input is closed")]
    Closed,
    /// The Ctrl-C handler could not be installed.
    #[error("failed to install the ctrl-c cancel handler")]
    CtrlC(#[source] ctrlc::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_error_display_carries_context() {
        let err = WorkError::task("double", 3, &5i64, &*TaskError::from("bad"));
        assert_eq!(err.stage(), "double");
        assert_eq!(err.worker(), Some(3));
        assert_eq!(err.offending_task(), Some("5"));
        assert_eq!(err.message(), "bad");
        assert_eq!(
            err.to_string(),
            "stage `double` worker 3 failed on task 5: bad"
        );
        assert!(!err.backtrace().is_empty());
    }

    #[test]
    fn lost_stage_has_no_worker_context() {
        let err = WorkError::lost("echo");
        assert_eq!(err.worker(), None);
        assert_eq!(err.offending_task(), None);
        assert!(err.to_string().starts_with("stage `echo` failed:"));
    }

    #[test]
    fn graph_misuse_messages() {
        assert_eq!(
            GraphMisuse::SelfLink("echo".into()).to_string(),
            "cannot link stage `echo` to itself"
        );
        assert_eq!(
            GraphMisuse::MultipleLeavesNotOrdered(2).to_string(),
            "ordered results require exactly one leaf stage, this graph has 2"
        );
    }

    #[test]
    fn work_error_converts_into_pipeline_error() {
        let err: PipelineError = WorkError::lost("echo").into();
        assert!(matches!(err, PipelineError::Task(_)));
    }
}
