#![deny(missing_docs)]

//! # Flowline
//!
//! Flowline is a multi-stage worker pipeline framework for embarrassingly
//! parallel bulk processing. A pipeline is a directed acyclic graph of
//! stages; each stage is a pool of identical workers that apply a
//! user-supplied transform to the tasks streamed through the graph. The
//! framework routes every input through the graph, fans work out across the
//! workers of each stage, propagates termination and failures, and delivers
//! results back to the caller, on request in original input order, even
//! though workers complete out of order.
//!
//! Stages are connected by *tubes*: typed FIFO channels, optionally bounded
//! so that a slow stage pushes back on its producers instead of buffering
//! without limit. End-of-stream is a token travelling through the tubes
//! rather than a property of the tubes themselves: when the caller signals
//! stop, a single stop token circulates among the workers of each stage
//! until all of them have seen it, and only then moves on downstream. This
//! stop-relay guarantees that every result precedes end-of-stream at every
//! tube, with no barrier primitive anywhere.
//!
//! A failing transform does not tear the process down. The error is wrapped
//! together with the stage name, the offending task and a backtrace captured
//! on the worker thread, and flows through the graph as a poison token that
//! terminates every stage it passes. The caller receives it with the
//! original diagnostic context intact.
//!
//! ## Module overview
//!
//! - The [core] module holds the building blocks: [`Tube`], the [`Worker`]
//!   contract with its [`Outbox`], and [`Stage`].
//! - The [graph] module holds the [`Pipeline`]: topology validation, task
//!   ingest with monotonic indices, result collection and the ordered
//!   re-sequencing buffer.
//! - The [workers] module is a small library of predefined workers
//!   ([`workers::FnWorker`], [`workers::Printer`]).
//! - The [introspect] module renders a pipeline's stage graph as text, see
//!   [`Pipeline::print_flow_graph()`].
//!
//! ## Example: a three-stage chain
//!
//! ```rust
//! use flowline::prelude::*;
//!
//! # fn main() -> Result<(), PipelineError> {
//! let increment = Stage::from_fn("increment", |v: i64| v + 1).with_workers(4);
//! let double = Stage::from_fn("double", |v: i64| v * 2).with_workers(4);
//! let echo = Stage::from_fn("echo", |v: i64| v);
//! increment.link(&double)?;
//! double.link(&echo)?;
//!
//! let mut pipeline = Pipeline::new(increment)?;
//! let results: Vec<i64> = pipeline
//!     .run_ordered(0..10)?
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(results, vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
//! # Ok(())
//! # }
//! ```
//!
//! Workers with state (a connection, a model, a scratch buffer) implement
//! the [`Worker`] trait directly: `init` runs once on the worker's own
//! thread before the first task, `process` transforms one task at a time,
//! and `dispose` runs on every exit path. A stage is given a factory so each
//! of its workers gets an instance of its own.
//!
//! ## Scheduling
//!
//! Workers block (on the input tube, on a full bounded output tube, and in
//! the user transform), so every worker owns a real thread.
//! [`Parallelism`] selects where it comes from: a dedicated OS thread (the
//! default), or the shared blocking pool of an ambient tokio runtime for
//! applications that already live inside one.
//!
//! ## Cancellation
//!
//! [`Pipeline::cancel`] injects a cancel token that propagates like a
//! failure and terminates the graph; the result iterators simply end. Wire
//! it to Ctrl-C with [`Pipeline::cancel_on_ctrlc`], or hand a
//! [`CancelHandle`] to whatever owns your shutdown path.

/// The core framework concepts: tubes, workers, stages.
pub mod core;
pub use crate::core::stage::Parallelism;
pub use crate::core::stage::Stage;
pub use crate::core::tube::Tube;
pub use crate::core::tube::TubeError;
pub use crate::core::tube::TubeKind;
pub use crate::core::worker::Outbox;
pub use crate::core::worker::Worker;

/// The failure taxonomy.
pub mod error;
pub use crate::error::GraphMisuse;
pub use crate::error::PipelineError;
pub use crate::error::TaskError;
pub use crate::error::WorkError;

/// The pipeline orchestrator.
pub mod graph;
pub use crate::graph::pipeline::CancelHandle;
pub use crate::graph::pipeline::OrderedResults;
pub use crate::graph::pipeline::Pipeline;
pub use crate::graph::pipeline::Results;

/// Introspection
pub mod introspect;

/// Library of predefined workers.
pub mod workers;

/// The prelude module contains the most important traits and structs of the
/// library.
pub mod prelude {
    pub use crate::CancelHandle;
    pub use crate::GraphMisuse;
    pub use crate::OrderedResults;
    pub use crate::Outbox;
    pub use crate::Parallelism;
    pub use crate::Pipeline;
    pub use crate::PipelineError;
    pub use crate::Results;
    pub use crate::Stage;
    pub use crate::TaskError;
    pub use crate::Tube;
    pub use crate::TubeError;
    pub use crate::TubeKind;
    pub use crate::WorkError;
    pub use crate::Worker;
}
