use std::fmt::Display;

use crate::core::worker::{Outbox, Worker};
use crate::error::TaskError;

/// Sink worker that prints every task to stdout under a topic.
///
/// Emits nothing downstream, so it pairs naturally with
/// [`Stage::discard_results`](crate::Stage::discard_results) on a leaf
/// stage.
pub struct Printer {
    topic: String,
}

impl Printer {
    /// A printer tagging every line with `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Printer {
            topic: topic.into(),
        }
    }
}

impl<T: Display + Send> Worker<T> for Printer {
    fn process(&mut self, task: T, _outbox: &Outbox<'_, T>) -> Result<Option<T>, TaskError> {
        println!("{}: {}", self.topic, task);
        Ok(None)
    }
}
