use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

/// Error returned by tube reads.
///
/// A timeout is distinct from end-of-stream: end-of-stream is carried by the
/// stop token inside the item stream, while `Closed` means every handle on
/// the producing side is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TubeError {
    /// `get_timeout` elapsed without an item arriving.
    #[error("timed out waiting on the tube")]
    Timeout,
    /// Every producer handle of the tube has been dropped.
    #[error("tube is closed")]
    Closed,
}

/// The two tube flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeKind {
    /// Point-to-point link, unbounded.
    Pipe,
    /// Fan-capable queue, optionally bounded to create backpressure.
    Queue,
}

/// A unidirectional FIFO channel between a producer and one or more
/// consumers.
///
/// Both flavors sit on a multi-producer multi-consumer channel; the flavor is
/// kept for construction intent and introspection. A bounded queue tube makes
/// `put` block while full, which transitively stalls upstream workers: the
/// backpressure mechanism that keeps slow-consumer stages from buffering
/// without limit.
///
/// There is no explicit close operation: a tube closes once every handle on
/// one side has been dropped, releasing any blocked peer with
/// [`TubeError::Closed`].
#[derive(Debug, Clone)]
pub struct Tube<M> {
    kind: TubeKind,
    capacity: Option<usize>,
    tx: Sender<M>,
    rx: Receiver<M>,
}

impl<M> Tube<M> {
    /// Create an unbounded point-to-point tube.
    pub fn pipe() -> Self {
        let (tx, rx) = unbounded();
        Tube {
            kind: TubeKind::Pipe,
            capacity: None,
            tx,
            rx,
        }
    }

    /// Create a queue tube, bounded to `max_backlog` items when given.
    pub fn queue(max_backlog: Option<usize>) -> Self {
        let (tx, rx) = match max_backlog {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        Tube {
            kind: TubeKind::Queue,
            capacity: max_backlog,
            tx,
            rx,
        }
    }

    /// Put an item on the tube. Blocks while a bounded tube is full.
    pub fn put(&self, item: M) -> Result<(), TubeError> {
        self.tx.send(item).map_err(|_| TubeError::Closed)
    }

    /// Next item from the tube. Blocks until one arrives or the tube closes.
    pub fn get(&self) -> Result<M, TubeError> {
        self.rx.recv().map_err(|_| TubeError::Closed)
    }

    /// Next item from the tube, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<M, TubeError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TubeError::Timeout,
            RecvTimeoutError::Disconnected => TubeError::Closed,
        })
    }

    /// The tube's flavor.
    pub fn kind(&self) -> TubeKind {
        self.kind
    }

    /// Bound of the tube, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(crate) fn sender(&self) -> Sender<M> {
        self.tx.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<M> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_fifo_order() {
        let tube = Tube::pipe();
        tube.put(1).unwrap();
        tube.put(2).unwrap();
        tube.put(3).unwrap();
        assert_eq!(tube.get().unwrap(), 1);
        assert_eq!(tube.get().unwrap(), 2);
        assert_eq!(tube.get().unwrap(), 3);
    }

    #[test]
    fn timeout_is_distinct_from_closed() {
        let tube: Tube<u32> = Tube::queue(Some(1));
        assert_eq!(
            tube.get_timeout(Duration::from_millis(10)),
            Err(TubeError::Timeout)
        );

        let rx = tube.receiver();
        drop(tube);
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn closed_when_producers_are_gone() {
        let tube: Tube<u32> = Tube::pipe();
        let rx = tube.receiver();
        drop(tube);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn bounded_queue_blocks_when_full() {
        let tube = Tube::queue(Some(2));
        tube.put(1).unwrap();
        tube.put(2).unwrap();
        assert!(tube.sender().try_send(3).is_err());
        assert_eq!(tube.get().unwrap(), 1);
        assert!(tube.sender().try_send(3).is_ok());
    }
}
