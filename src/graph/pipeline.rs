use crossbeam_channel::{Receiver, Select, Sender};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::envelope::{Envelope, Payload};
use crate::core::stage::{BuildOutput, Stage};
use crate::error::{GraphMisuse, PipelineError, WorkError};
use crate::graph::topology::Topology;
use crate::introspect::flow_graph::FlowGraph;

/// A read end of one leaf stage's synthesized output tube.
struct Leaf<T> {
    stage: String,
    rx: Receiver<Envelope<T>>,
    open: bool,
}

struct Ingest {
    next_index: u64,
    stopped: bool,
}

enum RunState {
    Running,
    Poisoned(WorkError),
    Cancelled,
    Finished,
}

/// A pipeline of stages.
///
/// Wraps the root stage of a DAG: construction validates the topology,
/// builds every reachable stage exactly once and starts their workers.
/// Tasks go in through [`Pipeline::put`], which tags each with a monotonic
/// index; results come back out from the leaf stages, either in completion
/// order ([`Pipeline::results`]) or re-sequenced into input order
/// ([`Pipeline::results_ordered`]).
///
/// Dropping the pipeline drops its end of every tube, which unwinds any
/// workers still running.
pub struct Pipeline<T> {
    topology: Topology,
    root_tx: Sender<Envelope<T>>,
    leaves: Vec<Leaf<T>>,
    joins: Vec<(String, Receiver<()>)>,
    ingest: Mutex<Ingest>,
    state: RunState,
}

impl<T: Clone + Debug + Send + 'static> Pipeline<T> {
    /// Build the graph rooted at `root` and start all workers.
    ///
    /// Fails without starting anything when the graph is not a DAG, and
    /// fails on the first stage that cannot be built (already built, empty
    /// worker pool, invalid backlog, spawn failure).
    pub fn new(root: Stage<T>) -> Result<Self, PipelineError> {
        let topology = Topology::from_root(&root);
        topology.ensure_acyclic()?;

        let root_tx = root
            .input_sender()
            .ok_or_else(|| GraphMisuse::AlreadyBuilt(root.name().to_owned()))?;

        let mut out = BuildOutput::default();
        root.build(&mut out)?;
        info!(
            stages = topology.stage_count(),
            leaves = out.leaves.len(),
            "pipeline built"
        );

        Ok(Pipeline {
            topology,
            root_tx,
            leaves: out
                .leaves
                .into_iter()
                .map(|(stage, rx)| Leaf {
                    stage,
                    rx,
                    open: true,
                })
                .collect(),
            joins: out.joins,
            ingest: Mutex::new(Ingest {
                next_index: 0,
                stopped: false,
            }),
            state: RunState::Running,
        })
    }

    /// Put a task on the pipeline and return the index assigned to it.
    ///
    /// Safe to call from several producer threads; the index sequence stays
    /// strictly increasing. Blocks while the root stage's bounded input tube
    /// is full. Fails once [`Pipeline::stop`] has been called.
    pub fn put(&self, task: T) -> Result<u64, PipelineError> {
        let mut ingest = self.ingest.lock().unwrap();
        if ingest.stopped {
            return Err(GraphMisuse::PutAfterStop.into());
        }
        let index = ingest.next_index;
        self.root_tx
            .send(Envelope::data(index, task))
            .map_err(|_| PipelineError::Closed)?;
        ingest.next_index += 1;
        Ok(index)
    }

    /// Signal end-of-stream. The stop token relays through every stage and
    /// arrives at each leaf exactly once, behind all admitted data. A second
    /// stop is a no-op.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let mut ingest = self.ingest.lock().unwrap();
        if ingest.stopped {
            return Ok(());
        }
        self.root_tx
            .send(Envelope::stop())
            .map_err(|_| PipelineError::Closed)?;
        ingest.stopped = true;
        Ok(())
    }

    /// Inject a cancel token. It propagates through the graph like a
    /// failure, terminating every stage it reaches;
    /// [`Pipeline::get`] reports it as a plain end of results.
    pub fn cancel(&self) {
        let _ = self.root_tx.send(Envelope::cancel());
    }

    /// A clonable handle for cancelling from another thread (for instance a
    /// signal handler).
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            tx: self.root_tx.clone(),
        }
    }

    /// Cancel the pipeline when the process receives Ctrl-C.
    ///
    /// Installs a process-wide handler; fails if one is already installed.
    pub fn cancel_on_ctrlc(&self) -> Result<(), PipelineError> {
        let handle = self.cancel_handle();
        ctrlc::set_handler(move || {
            warn!("ctrl-c received, cancelling the pipeline");
            handle.cancel();
        })
        .map_err(PipelineError::CtrlC)
    }

    /// Next result from any leaf stage, as `(index, value)`.
    ///
    /// Returns `Ok(None)` once every leaf has delivered its stop token (all
    /// workers joined, cleanup complete) or when the run was cancelled.
    /// With a timeout, returns [`PipelineError::Timeout`] if nothing arrived
    /// in time; the pipeline keeps running and the call can be retried.
    /// A failure anywhere in the graph surfaces here as
    /// [`PipelineError::Task`] carrying the original diagnostic context; the
    /// poison token is re-injected at the root so remaining branches unwind.
    pub fn get(&mut self, timeout: Option<Duration>) -> Result<Option<(u64, T)>, PipelineError> {
        loop {
            match &self.state {
                RunState::Finished | RunState::Cancelled => return Ok(None),
                RunState::Poisoned(err) => return Err(err.clone().into()),
                RunState::Running => {}
            }

            let open: Vec<usize> = self
                .leaves
                .iter()
                .enumerate()
                .filter(|(_, leaf)| leaf.open)
                .map(|(i, _)| i)
                .collect();
            if open.is_empty() {
                self.join();
                self.state = RunState::Finished;
                info!("pipeline drained");
                return Ok(None);
            }

            // Wait on every open leaf at once, so an idle branch cannot
            // starve the others.
            let (leaf_index, received) = {
                let mut select = Select::new();
                for &i in &open {
                    select.recv(&self.leaves[i].rx);
                }
                let oper = match timeout {
                    Some(limit) => match select.select_timeout(limit) {
                        Ok(oper) => oper,
                        Err(_) => return Err(PipelineError::Timeout),
                    },
                    None => select.select(),
                };
                let leaf_index = open[oper.index()];
                (leaf_index, oper.recv(&self.leaves[leaf_index].rx))
            };

            match received {
                Ok(envelope) => match envelope.payload {
                    Payload::Data { index, value } => return Ok(Some((index, value))),
                    Payload::Stop => {
                        debug!(stage = %self.leaves[leaf_index].stage, "leaf stage drained");
                        self.leaves[leaf_index].open = false;
                    }
                    Payload::Fail(err) => {
                        // Re-inject at the root so the remaining branches
                        // unwind too. Non-blocking: a full bounded root tube
                        // must not wedge the draining side, and the stages
                        // terminate through tube disconnection regardless.
                        if let Err(send_err) = self.root_tx.try_send(Envelope::fail(err.clone())) {
                            debug!(%send_err, "poison re-injection dropped");
                        }
                        self.state = RunState::Poisoned(err.clone());
                        return Err(err.into());
                    }
                    Payload::Cancel => {
                        warn!("pipeline cancelled");
                        self.state = RunState::Cancelled;
                        return Ok(None);
                    }
                },
                Err(_) => {
                    let err = WorkError::lost(&self.leaves[leaf_index].stage);
                    self.leaves[leaf_index].open = false;
                    self.state = RunState::Poisoned(err.clone());
                    return Err(err.into());
                }
            }
        }
    }

    /// Iterate over results in completion order.
    ///
    /// Yields one `Err` and then ends if the graph is poisoned.
    pub fn results(&mut self) -> Results<'_, T> {
        Results {
            pipeline: self,
            fused: false,
        }
    }

    /// Iterate over results in input order.
    ///
    /// Requires exactly one leaf stage; out-of-order arrivals are held in a
    /// re-sequencing buffer keyed by task index until their turn comes.
    pub fn results_ordered(&mut self) -> Result<OrderedResults<'_, T>, PipelineError> {
        if self.leaves.len() != 1 {
            return Err(GraphMisuse::MultipleLeavesNotOrdered(self.leaves.len()).into());
        }
        Ok(OrderedResults {
            pipeline: self,
            pending: HashMap::new(),
            next_expected: 0,
            fused: false,
        })
    }

    /// Push every input, signal stop, and return the unordered result
    /// iterator.
    pub fn run<I>(&mut self, inputs: I) -> Result<Results<'_, T>, PipelineError>
    where
        I: IntoIterator<Item = T>,
    {
        for task in inputs {
            self.put(task)?;
        }
        self.stop()?;
        Ok(self.results())
    }

    /// Push every input, signal stop, and return the ordered result
    /// iterator. Requires exactly one leaf stage.
    pub fn run_ordered<I>(&mut self, inputs: I) -> Result<OrderedResults<'_, T>, PipelineError>
    where
        I: IntoIterator<Item = T>,
    {
        for task in inputs {
            self.put(task)?;
        }
        self.stop()?;
        self.results_ordered()
    }

    /// Print the stage graph to stdout.
    pub fn print_flow_graph(&self) {
        FlowGraph::new(&self.topology).print();
    }

    /// Wait until every worker of every stage has exited and disposed.
    fn join(&self) {
        for (stage, done) in &self.joins {
            let _ = done.recv();
            debug!(stage = %stage, "stage joined");
        }
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.topology.stage_count())
            .field("leaves", &self.leaves.len())
            .finish_non_exhaustive()
    }
}

/// Sends a cancel token into the pipeline from anywhere.
pub struct CancelHandle<T> {
    tx: Sender<Envelope<T>>,
}

impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        CancelHandle {
            tx: self.tx.clone(),
        }
    }
}

impl<T> CancelHandle<T> {
    /// Inject a cancel token. Harmless once the pipeline has torn down.
    pub fn cancel(&self) {
        let _ = self.tx.send(Envelope::cancel());
    }
}

/// Unordered result iterator, yielding values in completion order.
pub struct Results<'a, T> {
    pipeline: &'a mut Pipeline<T>,
    fused: bool,
}

impl<T: Clone + Debug + Send + 'static> Iterator for Results<'_, T> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.pipeline.get(None) {
            Ok(Some((_, value))) => Some(Ok(value)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}

/// Ordered result iterator: re-sequences completion-order arrivals back into
/// input-index order.
pub struct OrderedResults<'a, T> {
    pipeline: &'a mut Pipeline<T>,
    pending: HashMap<u64, T>,
    next_expected: u64,
    fused: bool,
}

impl<T: Clone + Debug + Send + 'static> Iterator for OrderedResults<'_, T> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.pending.remove(&self.next_expected) {
                self.next_expected += 1;
                return Some(Ok(value));
            }
            if self.fused {
                // Workers that emitted nothing for a task leave index gaps;
                // whatever is still buffered at end-of-stream comes out in
                // ascending index order.
                let index = self.pending.keys().min().copied()?;
                let value = self.pending.remove(&index).unwrap();
                self.next_expected = index + 1;
                return Some(Ok(value));
            }
            match self.pipeline.get(None) {
                Ok(Some((index, value))) => {
                    self.pending.insert(index, value);
                }
                Ok(None) => self.fused = true,
                Err(err) => {
                    self.fused = true;
                    self.pending.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Stage<i64> {
        Stage::from_fn(name, |v| v)
    }

    #[test]
    fn put_after_stop_is_rejected() {
        let pipeline = Pipeline::new(identity("echo")).unwrap();
        pipeline.put(1).unwrap();
        pipeline.stop().unwrap();
        assert!(matches!(
            pipeline.put(2).unwrap_err(),
            PipelineError::Graph(GraphMisuse::PutAfterStop)
        ));
    }

    #[test]
    fn second_stop_is_a_no_op() {
        let mut pipeline = Pipeline::new(identity("echo")).unwrap();
        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        assert!(pipeline.get(None).unwrap().is_none());
        // And still a no-op once everything has drained.
        pipeline.stop().unwrap();
    }

    #[test]
    fn ordered_results_require_a_single_leaf() {
        let root = identity("root");
        let left = identity("left");
        let right = identity("right");
        root.link(&left).unwrap().link(&right).unwrap();

        let mut pipeline = Pipeline::new(root).unwrap();
        let err = pipeline.results_ordered().err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Graph(GraphMisuse::MultipleLeavesNotOrdered(2))
        ));
        pipeline.stop().unwrap();
    }

    #[test]
    fn cyclic_graphs_are_rejected_before_any_worker_starts() {
        let a = identity("a");
        let b = identity("b");
        a.link(&b).unwrap();
        b.link(&a).unwrap();
        assert!(matches!(
            Pipeline::new(a).unwrap_err(),
            PipelineError::Graph(GraphMisuse::Cycle(_))
        ));
    }

    #[test]
    fn cancel_ends_the_run_without_an_error() {
        let mut pipeline = Pipeline::new(identity("echo").with_workers(2)).unwrap();
        pipeline.cancel();
        assert!(pipeline.get(None).unwrap().is_none());
    }

    #[test]
    fn get_times_out_while_workers_are_idle() {
        let mut pipeline = Pipeline::new(identity("echo")).unwrap();
        assert!(matches!(
            pipeline.get(Some(Duration::from_millis(20))),
            Err(PipelineError::Timeout)
        ));
        pipeline.stop().unwrap();
        assert!(pipeline.get(None).unwrap().is_none());
    }
}
