//! The classic three-stage chain: increment, double, echo.
//!
//! Every stage runs a pool of workers whose transform sleeps for a while, so
//! the wall clock shows the stages overlapping. Results come back in input
//! order. Ctrl-C cancels the run.

use flowline::prelude::*;
use std::time::{Duration, Instant};

fn increment(value: i64) -> i64 {
    std::thread::sleep(Duration::from_millis(1200));
    value + 1
}

fn double(value: i64) -> i64 {
    std::thread::sleep(Duration::from_millis(1200));
    value * 2
}

fn echo(value: i64) -> i64 {
    std::thread::sleep(Duration::from_millis(1000));
    value
}

fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt::init();

    let workers = 100;
    let stage1 = Stage::from_fn("increment", increment)
        .with_workers(workers)
        .log_timings();
    let stage2 = Stage::from_fn("double", double).with_workers(workers);
    let stage3 = Stage::from_fn("echo", echo).with_workers(workers);
    stage1.link(&stage2)?;
    stage2.link(&stage3)?;

    let mut pipeline = Pipeline::new(stage1)?;
    pipeline.cancel_on_ctrlc()?;
    pipeline.print_flow_graph();

    let start = Instant::now();
    for result in pipeline.run_ordered(0..10)? {
        println!("{}", result?);
    }
    println!("total time: {:.2?}", start.elapsed());
    Ok(())
}
