use std::sync::Arc;

use crate::core::worker::{Outbox, Worker};
use crate::error::TaskError;

/// A worker that delegates its transform to a plain function or closure.
///
/// This is what [`Stage::from_fn`](crate::Stage::from_fn) and
/// [`Stage::from_try_fn`](crate::Stage::from_try_fn) put in the pool: every
/// worker of the stage shares the same function and has no state of its own.
pub struct FnWorker<T> {
    f: Arc<dyn Fn(T) -> Result<Option<T>, TaskError> + Send + Sync>,
}

impl<T> FnWorker<T> {
    /// Wrap the given function. Returning `Ok(None)` emits nothing for the
    /// task, which gives closure-backed filter stages.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(T) -> Result<Option<T>, TaskError> + Send + Sync + 'static,
    {
        FnWorker { f: Arc::new(f) }
    }
}

impl<T: Send> Worker<T> for FnWorker<T> {
    fn process(&mut self, task: T, _outbox: &Outbox<'_, T>) -> Result<Option<T>, TaskError> {
        (self.f)(task)
    }
}
