//! Core of the flowline pipeline framework: tubes, workers and stages.

/// Task envelopes circulating on tubes.
pub(crate) mod envelope;

/// Unidirectional FIFO channels.
pub mod tube;
pub use tube::Tube;
pub use tube::TubeError;
pub use tube::TubeKind;

/// Worker contract and the per-worker execution loop.
pub mod worker;
pub use worker::Outbox;
pub use worker::Worker;

/// Stages: pools of identical workers.
pub mod stage;
pub use stage::Parallelism;
pub use stage::Stage;

/// Per-worker timing buckets.
pub(crate) mod timing;
