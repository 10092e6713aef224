//! End-to-end pipeline scenarios: chains, fan-out, failure poisoning,
//! backpressure, cancellation and both scheduling substrates.

use flowline::prelude::*;
use flowline::workers::FnWorker;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn jitter(max_millis: u64) {
    let millis = rand::thread_rng().gen_range(0..max_millis);
    std::thread::sleep(Duration::from_millis(millis));
}

#[test]
fn ordered_chain_restores_input_order() {
    let increment = Stage::from_fn("increment", |v: i64| v + 1).with_workers(100);
    let double = Stage::from_fn("double", |v: i64| v * 2).with_workers(100);
    let echo = Stage::from_fn("echo", |v: i64| v).with_workers(100);
    increment.link(&double).unwrap();
    double.link(&echo).unwrap();

    let mut pipeline = Pipeline::new(increment).unwrap();
    let results: Vec<i64> = pipeline
        .run_ordered(0..10)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results, vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
}

#[test]
fn unordered_chain_delivers_the_full_multiset() {
    let increment = Stage::from_fn("increment", |v: i64| {
        jitter(20);
        v + 1
    })
    .with_workers(8);
    let double = Stage::from_fn("double", |v: i64| v * 2).with_workers(8);
    increment.link(&double).unwrap();

    let mut pipeline = Pipeline::new(increment).unwrap();
    let mut results: Vec<i64> = pipeline
        .run(0..10)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    results.sort_unstable();
    assert_eq!(results, (1..=10).map(|v| v * 2).collect::<Vec<_>>());
}

#[test]
fn failure_surfaces_with_original_context() {
    let flaky = Stage::from_try_fn("flaky", |v: i64| {
        if v == 5 {
            Err("bad".into())
        } else {
            Ok(v)
        }
    })
    .with_workers(4);

    let mut pipeline = Pipeline::new(flaky).unwrap();
    for v in 0..10 {
        pipeline.put(v).unwrap();
    }
    pipeline.stop().unwrap();

    let err = pipeline
        .results()
        .find_map(|result| result.err())
        .expect("the failure must reach the caller");
    match err {
        PipelineError::Task(work) => {
            assert_eq!(work.stage(), "flaky");
            assert_eq!(work.offending_task(), Some("5"));
            assert_eq!(work.message(), "bad");
            assert!(!work.backtrace().is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mid_stage_failure_reaches_the_caller_through_downstream_stages() {
    let first = Stage::from_fn("first", |v: i64| v).with_workers(2);
    let flaky = Stage::from_try_fn("flaky", |v: i64| {
        if v == 3 {
            Err("kaboom".into())
        } else {
            Ok(v)
        }
    })
    .with_workers(2);
    let last = Stage::from_fn("last", |v: i64| v).with_workers(2);
    first.link(&flaky).unwrap();
    flaky.link(&last).unwrap();

    let mut pipeline = Pipeline::new(first).unwrap();
    for v in 0..10 {
        pipeline.put(v).unwrap();
    }
    pipeline.stop().unwrap();

    let err = pipeline
        .results()
        .find_map(|result| result.err())
        .expect("the failure must cross the downstream stage");
    match err {
        PipelineError::Task(work) => {
            assert_eq!(work.stage(), "flaky");
            assert_eq!(work.offending_task(), Some("3"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn bounded_stage_applies_backpressure() {
    let started = Arc::new(AtomicUsize::new(0));
    let started_in_worker = started.clone();
    let slow = Stage::from_fn("slow", move |v: i64| {
        started_in_worker.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        v
    })
    .with_max_backlog(2);

    let mut pipeline = Pipeline::new(slow).unwrap();
    let mut max_in_flight = 0i64;
    for (admitted, v) in (0..30i64).enumerate() {
        pipeline.put(v).unwrap();
        let in_flight = admitted as i64 + 1 - started.load(Ordering::SeqCst) as i64;
        max_in_flight = max_in_flight.max(in_flight);
    }
    pipeline.stop().unwrap();

    let results: Vec<i64> = pipeline
        .results()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 30);
    // max_backlog envelopes queued plus one task in the worker's hands
    assert!(max_in_flight <= 3, "max in flight was {max_in_flight}");
}

#[test]
fn ordered_results_on_a_forked_graph_fail_fast() {
    let root = Stage::from_fn("root", |v: i64| v);
    let left = Stage::from_fn("left", |v: i64| v);
    let right = Stage::from_fn("right", |v: i64| v);
    root.link(&left).unwrap().link(&right).unwrap();

    let mut pipeline = Pipeline::new(root).unwrap();
    assert!(matches!(
        pipeline.results_ordered().err().unwrap(),
        PipelineError::Graph(GraphMisuse::MultipleLeavesNotOrdered(2))
    ));
    pipeline.stop().unwrap();
}

#[test]
fn identity_grid_preserves_the_input_set() {
    let stages: Vec<Stage<i64>> = (0..4)
        .map(|i| Stage::from_fn(format!("identity-{i}"), |v| v).with_workers(8))
        .collect();
    for pair in stages.windows(2) {
        pair[0].link(&pair[1]).unwrap();
    }

    let mut pipeline = Pipeline::new(stages[0].clone()).unwrap();
    let results: Vec<i64> = pipeline
        .run(0..1000)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 1000);
    let set: HashSet<i64> = results.iter().copied().collect();
    assert_eq!(set, (0..1000).collect::<HashSet<_>>());
}

#[test]
fn fan_out_graph_drains_every_leaf() {
    let root = Stage::from_fn("root", |v: i64| v).with_workers(2);
    let left = Stage::from_fn("left", |v: i64| v + 1000).with_workers(2);
    let right = Stage::from_fn("right", |v: i64| v + 2000).with_workers(2);
    root.link(&left).unwrap().link(&right).unwrap();

    let mut pipeline = Pipeline::new(root).unwrap();
    let mut results: Vec<i64> = pipeline
        .run(0..10)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    results.sort_unstable();

    let mut expected: Vec<i64> = (0..10)
        .map(|v| v + 1000)
        .chain((0..10).map(|v| v + 2000))
        .collect();
    expected.sort_unstable();
    assert_eq!(results, expected);
}

struct Duplicator;

impl Worker<i64> for Duplicator {
    fn process(&mut self, task: i64, outbox: &Outbox<'_, i64>) -> Result<Option<i64>, TaskError> {
        outbox.put(task)?;
        outbox.put(task + 100)?;
        Ok(None)
    }
}

#[test]
fn outbox_fan_out_emits_multiple_results_per_task() {
    let stage = Stage::new("duplicator", |_| Duplicator).with_workers(2);
    let mut pipeline = Pipeline::new(stage).unwrap();
    let mut results: Vec<i64> = pipeline
        .run(0..5)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    results.sort_unstable();
    assert_eq!(results, vec![0, 1, 2, 3, 4, 100, 101, 102, 103, 104]);
}

#[test]
fn filter_workers_thin_the_stream() {
    let evens = Stage::new("evens", |_| {
        FnWorker::new(|v: i64| Ok((v % 2 == 0).then_some(v)))
    });
    let mut pipeline = Pipeline::new(evens).unwrap();
    let mut results: Vec<i64> = pipeline
        .run(0..10)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    results.sort_unstable();
    assert_eq!(results, vec![0, 2, 4, 6, 8]);
}

#[test]
fn ordered_filter_stream_stays_ascending() {
    let evens = Stage::new("evens", |_| {
        FnWorker::new(|v: i64| Ok((v % 2 == 0).then_some(v)))
    })
    .with_workers(3);
    let mut pipeline = Pipeline::new(evens).unwrap();
    let results: Vec<i64> = pipeline
        .run_ordered(0..6)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results, vec![0, 2, 4]);
}

struct Lifecycle {
    inited: Arc<AtomicUsize>,
    disposed: Arc<AtomicUsize>,
}

impl Worker<i64> for Lifecycle {
    fn init(&mut self) -> Result<(), TaskError> {
        self.inited.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, task: i64, _outbox: &Outbox<'_, i64>) -> Result<Option<i64>, TaskError> {
        Ok(Some(task))
    }

    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn init_and_dispose_run_once_per_worker() {
    let inited = Arc::new(AtomicUsize::new(0));
    let disposed = Arc::new(AtomicUsize::new(0));
    let (i, d) = (inited.clone(), disposed.clone());
    let stage = Stage::new("lifecycle", move |_| Lifecycle {
        inited: i.clone(),
        disposed: d.clone(),
    })
    .with_workers(5);

    let mut pipeline = Pipeline::new(stage).unwrap();
    let results: Vec<i64> = pipeline
        .run(0..20)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 20);
    // End-of-stream is only reported after every worker has disposed.
    assert_eq!(inited.load(Ordering::SeqCst), 5);
    assert_eq!(disposed.load(Ordering::SeqCst), 5);
}

struct FailingInit;

impl Worker<i64> for FailingInit {
    fn init(&mut self) -> Result<(), TaskError> {
        Err("no database".into())
    }

    fn process(&mut self, task: i64, _outbox: &Outbox<'_, i64>) -> Result<Option<i64>, TaskError> {
        Ok(Some(task))
    }
}

#[test]
fn init_failure_poisons_the_run() {
    let stage = Stage::new("loader", |_| FailingInit).with_workers(2);
    let mut pipeline = Pipeline::new(stage).unwrap();
    pipeline.put(1).unwrap();
    pipeline.stop().unwrap();

    let err = pipeline
        .results()
        .find_map(|result| result.err())
        .expect("init failure must surface");
    match err {
        PipelineError::Task(work) => {
            assert_eq!(work.stage(), "loader");
            assert!(work.message().contains("no database"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn in_band_cancel_terminates_the_run_without_a_stop() {
    // One worker keeps the leaf stream strictly ordered behind the data, so
    // everything admitted before the cancel still comes out.
    let echo = Stage::from_fn("echo", |v: i64| v);
    let mut pipeline = Pipeline::new(echo).unwrap();
    for v in 0..50 {
        pipeline.put(v).unwrap();
    }
    pipeline.cancel();

    // No stop token was ever sent, yet the stream terminates cleanly once
    // the cancel has flushed through.
    let collected: Vec<Result<i64, PipelineError>> = pipeline.results().collect();
    assert!(collected.iter().all(|result| result.is_ok()));
    assert_eq!(collected.len(), 50);
    assert!(pipeline.get(None).unwrap().is_none());
}

#[test]
fn timeout_leaves_the_pipeline_usable() {
    let slow = Stage::from_fn("slow", |v: i64| {
        std::thread::sleep(Duration::from_millis(150));
        v
    });
    let mut pipeline = Pipeline::new(slow).unwrap();
    pipeline.put(7).unwrap();

    assert!(matches!(
        pipeline.get(Some(Duration::from_millis(10))),
        Err(PipelineError::Timeout)
    ));
    assert_eq!(pipeline.get(None).unwrap(), Some((0, 7)));
    pipeline.stop().unwrap();
    assert!(pipeline.get(None).unwrap().is_none());
}

#[test]
fn concurrent_producers_observe_increasing_indices() {
    let echo = Stage::from_fn("echo", |v: i64| v).with_workers(4);
    let pipeline = Pipeline::new(echo).unwrap();

    let indices: Vec<u64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4i64)
            .map(|producer| {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    (0..25i64)
                        .map(|i| pipeline.put(producer * 25 + i).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let unique: HashSet<u64> = indices.iter().copied().collect();
    assert_eq!(unique.len(), 100);
    assert_eq!(indices.iter().max(), Some(&99));

    let mut pipeline = pipeline;
    pipeline.stop().unwrap();
    let results: Vec<i64> = pipeline
        .results()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 100);
}

#[test]
fn blocking_pool_outside_a_runtime_is_rejected() {
    let stage = Stage::from_fn("double", |v: i64| v * 2)
        .with_parallelism(Parallelism::BlockingPool);
    assert!(matches!(
        Pipeline::new(stage).unwrap_err(),
        PipelineError::NoRuntime(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_pool_stages_run_inside_a_runtime() {
    let results = tokio::task::spawn_blocking(|| -> Result<Vec<i64>, PipelineError> {
        let double = Stage::from_fn("double", |v: i64| v * 2)
            .with_workers(4)
            .with_parallelism(Parallelism::BlockingPool);
        let mut pipeline = Pipeline::new(double)?;
        let results = pipeline.run_ordered(0..10)?.collect::<Result<_, _>>()?;
        Ok(results)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(results, (0..10).map(|v| v * 2).collect::<Vec<i64>>());
}
