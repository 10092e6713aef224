//! A forked graph: one root stage feeding a doubling branch and a printing
//! sink branch. Results from the doubling branch arrive in completion order;
//! the sink branch discards its output.

use flowline::prelude::*;
use flowline::workers::Printer;
use rand::Rng;
use std::time::Duration;

fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt::init();

    let jitter = Stage::from_fn("jitter", |value: u64| {
        let millis = rand::thread_rng().gen_range(10..200);
        std::thread::sleep(Duration::from_millis(millis));
        value
    })
    .with_workers(8);

    let double = Stage::from_fn("double", |value: u64| value * 2).with_workers(4);
    let sink = Stage::new("printer", |_| Printer::new("seen"))
        .with_max_backlog(4)
        .discard_results();

    jitter.link(&double)?.link(&sink)?;

    let mut pipeline = Pipeline::new(jitter)?;
    pipeline.print_flow_graph();

    for value in 0..20u64 {
        pipeline.put(value)?;
    }
    pipeline.stop()?;

    while let Some((index, value)) = pipeline.get(None)? {
        println!("task {index} -> {value}");
    }
    Ok(())
}
