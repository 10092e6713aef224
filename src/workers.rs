//! Library of predefined workers for common stage shapes.

/// Closure-backed worker.
pub mod fn_worker;
pub use fn_worker::FnWorker;

/// Printing sink worker.
pub mod printer;
pub use printer::Printer;
