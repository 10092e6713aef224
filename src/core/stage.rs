use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::fmt;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::core::envelope::Envelope;
use crate::core::tube::Tube;
use crate::core::worker::{Worker, WorkerRun};
use crate::error::{GraphMisuse, PipelineError};
use crate::workers::FnWorker;

/// Scheduling substrate for the workers of a stage.
///
/// Both modes are thread-parallel: the transform contract is blocking, so
/// every worker needs a real thread under it. They differ in where that
/// thread comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parallelism {
    /// Each worker runs on its own dedicated OS thread. Works everywhere and
    /// is the default.
    #[default]
    DedicatedThread,
    /// Workers run on the shared blocking pool of the ambient tokio runtime.
    /// Building a stage in this mode outside a runtime fails.
    BlockingPool,
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallelism::DedicatedThread => write!(f, "dedicated-thread"),
            Parallelism::BlockingPool => write!(f, "blocking-pool"),
        }
    }
}

type WorkerFactory<T> = Arc<dyn Fn(usize) -> Box<dyn Worker<T>> + Send + Sync>;

/// Handles a built stage hands back to the pipeline: where results come out,
/// and how to wait for workers to finish.
pub(crate) struct BuildOutput<T> {
    /// Read ends of the synthesized leaf tubes, one per leaf stage.
    pub leaves: Vec<(String, Receiver<Envelope<T>>)>,
    /// Per-stage join handles: the receiver disconnects once every worker of
    /// the stage has run its dispose.
    pub joins: Vec<(String, Receiver<()>)>,
}

impl<T> Default for BuildOutput<T> {
    fn default() -> Self {
        BuildOutput {
            leaves: Vec::new(),
            joins: Vec::new(),
        }
    }
}

struct StageState<T> {
    num_workers: usize,
    parallelism: Parallelism,
    disable_result: bool,
    max_backlog: Option<usize>,
    log_timings: bool,
    /// Present until build; the write end feeds tasks in, every worker gets
    /// a clone of both ends.
    input: Option<Tube<Envelope<T>>>,
    /// Senders of the downstream stages' input tubes (or of the synthesized
    /// leaf tube). Cleared at build once the workers hold their clones.
    outputs: Vec<Sender<Envelope<T>>>,
    next: Vec<Stage<T>>,
    has_parent: bool,
    built: bool,
}

struct StageInner<T> {
    name: String,
    factory: WorkerFactory<T>,
    state: Mutex<StageState<T>>,
}

/// A named pool of `num_workers` identical workers sharing one input tube and
/// emitting to one or more output tubes.
///
/// A stage is a cheap handle; clones refer to the same pool. Configure it
/// with the `with_*` builders, wire the graph with [`Stage::link`], then hand
/// the root stage to [`Pipeline::new`](crate::Pipeline::new), which builds
/// every reachable stage exactly once and starts the workers. A stage is
/// immutable once built.
pub struct Stage<T> {
    inner: Arc<StageInner<T>>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Stage {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Debug + Send + 'static> Stage<T> {
    /// Create a stage from a worker factory.
    ///
    /// The factory runs once per worker at build time and receives the
    /// worker's index within the stage (`0..num_workers`), so workers that
    /// care about their slot can capture it.
    pub fn new<W, F>(name: impl Into<String>, factory: F) -> Self
    where
        W: Worker<T> + 'static,
        F: Fn(usize) -> W + Send + Sync + 'static,
    {
        let factory: WorkerFactory<T> =
            Arc::new(move |index| Box::new(factory(index)) as Box<dyn Worker<T>>);
        Stage {
            inner: Arc::new(StageInner {
                name: name.into(),
                factory,
                state: Mutex::new(StageState {
                    num_workers: 1,
                    parallelism: Parallelism::default(),
                    disable_result: false,
                    max_backlog: None,
                    log_timings: false,
                    input: Some(Tube::pipe()),
                    outputs: Vec::new(),
                    next: Vec::new(),
                    has_parent: false,
                    built: false,
                }),
            }),
        }
    }

    /// Convenience: a stage whose workers apply a plain function to each
    /// task.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Stage::new(name, move |_| {
            let f = f.clone();
            FnWorker::new(move |task| Ok(Some(f(task))))
        })
    }

    /// Convenience: like [`Stage::from_fn`] for fallible functions. An error
    /// poisons the graph and surfaces at the caller with the offending task.
    pub fn from_try_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Result<T, crate::error::TaskError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Stage::new(name, move |_| {
            let f = f.clone();
            FnWorker::new(move |task| f(task).map(Some))
        })
    }

    /// Set the number of workers in the pool.
    pub fn with_workers(self, num_workers: usize) -> Self {
        self.configure(|state| state.num_workers = num_workers);
        self
    }

    /// Choose the scheduling substrate for the workers.
    pub fn with_parallelism(self, parallelism: Parallelism) -> Self {
        self.configure(|state| state.parallelism = parallelism);
        self
    }

    /// Bound the stage's input tube to `max_backlog` envelopes, so upstream
    /// producers block once the stage falls behind.
    ///
    /// Must be called before the stage is linked from upstream; the link
    /// captures the input tube.
    pub fn with_max_backlog(self, max_backlog: usize) -> Self {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.built || state.has_parent {
                warn!(
                    stage = %self.inner.name,
                    "ignoring max_backlog on a stage that is already linked or built"
                );
                drop(state);
                return self;
            }
            state.max_backlog = Some(max_backlog);
            state.input = Some(Tube::queue(Some(max_backlog)));
        }
        self
    }

    /// Drop whatever the workers' transforms return instead of forwarding it
    /// downstream. For side-effect stages such as sinks.
    pub fn discard_results(self) -> Self {
        self.configure(|state| state.disable_result = true);
        self
    }

    /// Report the per-worker timing buckets at info level when the workers
    /// finish (they are always reported at debug level).
    pub fn log_timings(self) -> Self {
        self.configure(|state| state.log_timings = true);
        self
    }

    fn configure(&self, apply: impl FnOnce(&mut StageState<T>)) {
        let mut state = self.inner.state.lock().unwrap();
        if state.built {
            warn!(stage = %self.inner.name, "ignoring configuration of a built stage");
            return;
        }
        apply(&mut state);
    }

    /// Link the given downstream stage by making its input tube one of this
    /// stage's output tubes. Returns this stage, so fan-out reads as
    /// `root.link(&a)?.link(&b)?`.
    pub fn link<'a>(&'a self, next: &Stage<T>) -> Result<&'a Self, GraphMisuse> {
        if Arc::ptr_eq(&self.inner, &next.inner) {
            return Err(GraphMisuse::SelfLink(self.inner.name.clone()));
        }

        // Two locks; order by address so concurrent cross-links cannot
        // deadlock.
        let (first, second) = if Arc::as_ptr(&self.inner) < Arc::as_ptr(&next.inner) {
            (&self.inner, &next.inner)
        } else {
            (&next.inner, &self.inner)
        };
        let first_guard = first.state.lock().unwrap();
        let second_guard = second.state.lock().unwrap();
        let (mut ours, mut theirs) = if Arc::ptr_eq(first, &self.inner) {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        if ours.built {
            return Err(GraphMisuse::AlreadyBuilt(self.inner.name.clone()));
        }
        if theirs.built {
            return Err(GraphMisuse::AlreadyBuilt(next.inner.name.clone()));
        }
        if theirs.has_parent {
            return Err(GraphMisuse::AlreadyLinked(next.inner.name.clone()));
        }

        let tube = theirs
            .input
            .as_ref()
            .expect("unbuilt stage always has an input tube");
        ours.outputs.push(tube.sender());
        ours.next.push(next.clone());
        theirs.has_parent = true;
        Ok(self)
    }

    /// The downstream leaf stages of this stage (this stage itself when
    /// nothing is linked downstream).
    pub fn leaves(&self) -> Vec<Stage<T>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_leaves(&mut seen, &mut out);
        out
    }

    fn collect_leaves(&self, seen: &mut HashSet<usize>, out: &mut Vec<Stage<T>>) {
        if !seen.insert(self.key()) {
            return;
        }
        let next = self.inner.state.lock().unwrap().next.clone();
        if next.is_empty() {
            out.push(self.clone());
            return;
        }
        for stage in next {
            stage.collect_leaves(seen, out);
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stable identity of the underlying pool, for graph bookkeeping.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Write end of the input tube; the pipeline takes one before build.
    pub(crate) fn input_sender(&self) -> Option<Sender<Envelope<T>>> {
        let state = self.inner.state.lock().unwrap();
        state.input.as_ref().map(Tube::sender)
    }

    pub(crate) fn snapshot(&self) -> StageSnapshot<T> {
        let state = self.inner.state.lock().unwrap();
        StageSnapshot {
            key: self.key(),
            name: self.inner.name.clone(),
            num_workers: state.num_workers,
            parallelism: state.parallelism,
            max_backlog: state.max_backlog,
            next: state.next.clone(),
        }
    }

    /// Create and start the stage's workers, then build all downstream
    /// stages. Called exactly once, by the pipeline.
    pub(crate) fn build(&self, out: &mut BuildOutput<T>) -> Result<(), PipelineError> {
        let name = &self.inner.name;
        let next = {
            let mut state = self.inner.state.lock().unwrap();
            if state.built {
                return Err(GraphMisuse::AlreadyBuilt(name.clone()).into());
            }
            if state.num_workers == 0 {
                return Err(GraphMisuse::ZeroWorkers(name.clone()).into());
            }
            if state.max_backlog == Some(0) {
                return Err(GraphMisuse::InvalidBacklog(name.clone()).into());
            }
            state.built = true;

            // A stage at the end of a fork has nowhere to emit; synthesize a
            // leaf tube the pipeline will read results from.
            if state.outputs.is_empty() {
                let leaf = Tube::pipe();
                state.outputs.push(leaf.sender());
                out.leaves.push((name.clone(), leaf.receiver()));
            }

            let input = state
                .input
                .take()
                .expect("unbuilt stage always has an input tube");
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
            out.joins.push((name.clone(), done_rx));

            debug!(
                stage = %name,
                workers = state.num_workers,
                parallelism = %state.parallelism,
                "building stage"
            );
            for index in 0..state.num_workers {
                let run = WorkerRun {
                    stage: name.clone(),
                    worker_index: index,
                    num_workers: state.num_workers,
                    disable_result: state.disable_result,
                    log_timings: state.log_timings,
                    input_tx: input.sender(),
                    input_rx: input.receiver(),
                    outputs: state.outputs.clone(),
                    done: done_tx.clone(),
                };
                let worker = (self.inner.factory)(index);
                spawn_worker(name, index, state.parallelism, run, worker)?;
            }

            // Drop this stage's own channel handles: from here on the
            // workers are the only holders, so a stage that has fully exited
            // closes its tubes by itself.
            state.outputs.clear();
            state.next.clone()
        };

        for stage in next {
            stage.build(out)?;
        }
        Ok(())
    }
}

fn spawn_worker<T: Clone + Debug + Send + 'static>(
    stage: &str,
    index: usize,
    parallelism: Parallelism,
    run: WorkerRun<T>,
    worker: Box<dyn Worker<T>>,
) -> Result<(), PipelineError> {
    match parallelism {
        Parallelism::DedicatedThread => {
            std::thread::Builder::new()
                .name(format!("{stage}-{index}"))
                .spawn(move || run.run(worker))
                .map_err(|source| PipelineError::Spawn {
                    stage: stage.to_owned(),
                    source,
                })?;
        }
        Parallelism::BlockingPool => {
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|_| PipelineError::NoRuntime(stage.to_owned()))?;
            handle.spawn_blocking(move || run.run(worker));
        }
    }
    Ok(())
}

pub(crate) struct StageSnapshot<T> {
    pub key: usize,
    pub name: String,
    pub num_workers: usize,
    pub parallelism: Parallelism,
    pub max_backlog: Option<usize>,
    pub next: Vec<Stage<T>>,
}
