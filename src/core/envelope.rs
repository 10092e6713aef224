use crate::error::WorkError;

/// What a tube item carries.
#[derive(Debug, Clone)]
pub(crate) enum Payload<T> {
    /// An input admitted by the pipeline, tagged with its ingest index.
    Data {
        /// Monotonic index assigned at `Pipeline::put`.
        index: u64,
        /// The task or result value.
        value: T,
    },
    /// End-of-stream marker, circulated by the stop-relay protocol.
    Stop,
    /// Poison token carrying an upstream failure.
    Fail(WorkError),
    /// Caller-initiated interruption.
    Cancel,
}

/// One item on a tube: a payload plus the relay counter.
///
/// `relays` counts how many workers of the stage currently holding a control
/// token (stop, fail, cancel) have already observed it. Data envelopes always
/// travel with a zero count.
#[derive(Debug, Clone)]
pub(crate) struct Envelope<T> {
    pub payload: Payload<T>,
    pub relays: usize,
}

impl<T> Envelope<T> {
    pub fn data(index: u64, value: T) -> Self {
        Envelope {
            payload: Payload::Data { index, value },
            relays: 0,
        }
    }

    pub fn stop() -> Self {
        Envelope {
            payload: Payload::Stop,
            relays: 0,
        }
    }

    pub fn fail(err: WorkError) -> Self {
        Envelope {
            payload: Payload::Fail(err),
            relays: 0,
        }
    }

    pub fn cancel() -> Self {
        Envelope {
            payload: Payload::Cancel,
            relays: 0,
        }
    }

    /// A control token re-injected into the stage it is circulating in.
    pub fn relayed(payload: Payload<T>, relays: usize) -> Self {
        Envelope { payload, relays }
    }
}
