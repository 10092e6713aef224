use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::envelope::{Envelope, Payload};
use crate::core::timing::WorkerTimers;
use crate::core::tube::TubeError;
use crate::error::{TaskError, WorkError};

/// A worker executes the user transform for one stage.
///
/// A stage holds `num_workers` instances created by the stage's factory, each
/// running on its own execution slot. Workers operate independently of their
/// siblings, fetching the first available task and publishing the result
/// whenever it is done, so result order across a stage is unconstrained (the
/// pipeline restores input order on request).
pub trait Worker<T>: Send {
    /// One-time initialization, run on the worker's own thread before any
    /// task. Failing here poisons the stage.
    fn init(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Transform one task.
    ///
    /// Returning `Ok(Some(value))` publishes `value` on every output tube
    /// under the current task index. Returning `Ok(None)` means the worker
    /// already published through the [`Outbox`] (possibly several values, or
    /// none at all). Errors and panics become poison tokens that carry the
    /// offending task to the caller.
    fn process(&mut self, task: T, outbox: &Outbox<'_, T>) -> Result<Option<T>, TaskError>;

    /// Cleanup, run on every exit path: normal drain, failure and
    /// cancellation alike.
    fn dispose(&mut self) {}
}

/// Handle through which a worker publishes results while processing a task.
pub struct Outbox<'a, T> {
    outputs: &'a [Sender<Envelope<T>>],
    index: u64,
}

impl<T: Clone> Outbox<'_, T> {
    /// Publish `value` as a result of the task being processed.
    pub fn put(&self, value: T) -> Result<(), TubeError> {
        self.put_at(self.index, value)
    }

    /// Publish a result under an explicit task index.
    ///
    /// For workers that emit several outputs per input. Note that ordered
    /// result delivery keys on unique indices, so multi-output stages pair
    /// with unordered delivery.
    pub fn put_at(&self, index: u64, value: T) -> Result<(), TubeError> {
        if send_all(self.outputs, Envelope::data(index, value)) == 0 {
            return Err(TubeError::Closed);
        }
        Ok(())
    }

    /// Index assigned to the task being processed.
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Broadcast an envelope to every output tube, cloning for all but the last.
///
/// Returns how many tubes accepted it. A send only fails once a downstream
/// stage has fully gone away, so failures are expected during teardown.
fn send_all<T: Clone>(outputs: &[Sender<Envelope<T>>], envelope: Envelope<T>) -> usize {
    let Some((last, rest)) = outputs.split_last() else {
        return 0;
    };
    let mut delivered = 0;
    for tube in rest {
        if tube.send(envelope.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!("output tube closed, skipping");
        }
    }
    if last.send(envelope).is_ok() {
        delivered += 1;
    } else {
        debug!("output tube closed, skipping");
    }
    delivered
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}

/// Everything one worker needs to participate in its stage: the shared input
/// tube (the read end for tasks, the write end for relaying control
/// tokens to siblings), the output tube senders, and the stage
/// parameters that drive the relay arithmetic.
pub(crate) struct WorkerRun<T> {
    pub stage: String,
    pub worker_index: usize,
    pub num_workers: usize,
    pub disable_result: bool,
    pub log_timings: bool,
    pub input_tx: Sender<Envelope<T>>,
    pub input_rx: Receiver<Envelope<T>>,
    pub outputs: Vec<Sender<Envelope<T>>>,
    /// Held open for the lifetime of the worker; the stage joins by waiting
    /// for every clone to drop.
    pub done: Sender<()>,
}

impl<T: Clone + Debug + Send + 'static> WorkerRun<T> {
    /// The worker main loop: init, fetch, dispatch, dispose.
    pub(crate) fn run(self, mut worker: Box<dyn Worker<T>>) {
        let mut timers = WorkerTimers::new();
        self.drive(&mut *worker, &mut timers);

        let start = Instant::now();
        worker.dispose();
        timers.dispose.record_since(start);

        if self.log_timings {
            info!(
                stage = %self.stage,
                worker = self.worker_index,
                timings = %timers.summary(),
                "worker finished"
            );
        } else {
            debug!(
                stage = %self.stage,
                worker = self.worker_index,
                timings = %timers.summary(),
                "worker finished"
            );
        }
        // `self.done` drops here, after dispose: joining the stage waits for
        // cleanup, not just for the loop to wind down.
    }

    fn drive(&self, worker: &mut dyn Worker<T>, timers: &mut WorkerTimers) {
        let start = Instant::now();
        let init_outcome = catch_unwind(AssertUnwindSafe(|| worker.init()));
        timers.init.record_since(start);
        match init_outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.poison(WorkError::during_init(
                    &self.stage,
                    self.worker_index,
                    err.to_string(),
                ));
                return;
            }
            Err(payload) => {
                self.poison(WorkError::during_init(
                    &self.stage,
                    self.worker_index,
                    panic_message(payload),
                ));
                return;
            }
        }

        loop {
            let start = Instant::now();
            let envelope = match self.input_rx.recv() {
                Ok(envelope) => {
                    timers.input_wait.record_since(start);
                    envelope
                }
                Err(_) => {
                    // The upstream stage vanished without a stop token. The
                    // siblings each observe this on their own, so there is
                    // nothing to relay; poison downstream and leave.
                    let err = WorkError::transport(&self.stage, self.worker_index);
                    warn!(stage = %self.stage, worker = self.worker_index, %err, "input tube closed");
                    send_all(&self.outputs, Envelope::fail(err));
                    return;
                }
            };

            match envelope.payload {
                Payload::Data { index, value } => {
                    if !self.handle_task(worker, timers, index, value) {
                        return;
                    }
                }
                Payload::Stop => {
                    // Stop-relay: each sibling bumps the counter once; the
                    // last one forwards end-of-stream downstream. Everything
                    // admitted before the stop has already been fetched by
                    // some sibling at this point.
                    let seen = envelope.relays + 1;
                    if seen == self.num_workers {
                        send_all(&self.outputs, Envelope::stop());
                    } else {
                        let _ = self
                            .input_tx
                            .send(Envelope::relayed(Payload::Stop, seen));
                    }
                    debug!(stage = %self.stage, worker = self.worker_index, seen, "stop observed");
                    return;
                }
                Payload::Fail(err) => {
                    self.relay(Payload::Fail(err.clone()), envelope.relays);
                    send_all(&self.outputs, Envelope::fail(err));
                    return;
                }
                Payload::Cancel => {
                    self.relay(Payload::Cancel, envelope.relays);
                    send_all(&self.outputs, Envelope::cancel());
                    return;
                }
            }
        }
    }

    /// Run the transform for one task. Returns false when the worker must
    /// exit.
    fn handle_task(
        &self,
        worker: &mut dyn Worker<T>,
        timers: &mut WorkerTimers,
        index: u64,
        value: T,
    ) -> bool {
        // Retain a copy so a failure can report the offending task.
        let retained = value.clone();
        let outbox = Outbox {
            outputs: &self.outputs,
            index,
        };

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| worker.process(value, &outbox)));
        timers.per_task.record_since(start);

        match outcome {
            Ok(Ok(Some(result))) => {
                if self.disable_result {
                    return true;
                }
                let start = Instant::now();
                let delivered = send_all(&self.outputs, Envelope::data(index, result));
                timers.output_wait.record_since(start);
                if delivered == 0 {
                    warn!(
                        stage = %self.stage,
                        worker = self.worker_index,
                        "all output tubes closed, worker exiting"
                    );
                    return false;
                }
                true
            }
            Ok(Ok(None)) => true,
            Ok(Err(err)) => {
                self.poison(WorkError::task(
                    &self.stage,
                    self.worker_index,
                    &retained,
                    err.as_ref(),
                ));
                false
            }
            Err(payload) => {
                self.poison(WorkError::panicked(
                    &self.stage,
                    self.worker_index,
                    &retained,
                    panic_message(payload),
                ));
                false
            }
        }
    }

    /// Keep a fail or cancel token circulating until every sibling has seen
    /// it.
    ///
    /// Uses a non-blocking put: if the input tube is momentarily full the
    /// relay is dropped, and the siblings terminate anyway once the stage's
    /// tubes disconnect. Blocking here could wedge a stage whose workers all
    /// fail at once on a full bounded tube. The stop relay does not take this
    /// path: by the time a stop circulates, the stage's own workers are the
    /// only producers left, so the slot freed by the fetch is available.
    fn relay(&self, payload: Payload<T>, relays: usize) {
        let seen = relays + 1;
        if seen < self.num_workers {
            if let Err(err) = self.input_tx.try_send(Envelope::relayed(payload, seen)) {
                debug!(stage = %self.stage, worker = self.worker_index, %err, "relay dropped");
            }
        }
    }

    /// A failure originated here: hand it to the siblings and to every
    /// downstream tube, so the whole stage terminates without an explicit
    /// close operation.
    fn poison(&self, err: WorkError) {
        warn!(stage = %self.stage, worker = self.worker_index, %err, "worker failed");
        self.relay(Payload::Fail(err.clone()), 0);
        send_all(&self.outputs, Envelope::fail(err));
    }
}
