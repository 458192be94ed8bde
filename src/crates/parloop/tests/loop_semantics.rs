//! Integration tests for break, stop, cancellation and failure handling of loop runs

use parking_lot::Mutex;
use parloop::{
    CancellationSource, CancellationToken, EngineConfig, LoopStatus, ParallelEngine, ParallelError,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn engine(workers: usize) -> ParallelEngine {
    ParallelEngine::new(EngineConfig::new().with_max_degree_of_parallelism(workers)).unwrap()
}

#[test]
fn test_single_worker_break_runs_exact_prefix() {
    let seen = Mutex::new(Vec::new());

    let result = engine(1).for_range(1..100, &CancellationToken::none(), |i, state| {
        seen.lock().push(i);
        if i == 42 {
            state.request_break();
        }
        Ok(())
    });

    assert_eq!(result.status(), LoopStatus::Broken { lowest_break_index: 42 });
    assert_eq!(seen.into_inner(), (1..=42).collect::<Vec<_>>());
    assert_eq!(result.executed(), 42);
}

#[test]
fn test_parallel_break_never_started_above_break_after_observation() {
    // Record the break point each item saw right before it started work. An
    // item that saw a break below its own index would have been started by
    // the engine after the check that should have stopped it.
    let late_starts = Mutex::new(Vec::new());

    let result = engine(6).for_range(1..100, &CancellationToken::none(), |i, state| {
        if state.should_skip() && state.lowest_break_index().is_some_and(|b| b < i) {
            late_starts.lock().push(i);
        }
        if i == 42 {
            state.request_break();
        }
        std::thread::sleep(Duration::from_micros(200));
        Ok(())
    });

    assert_eq!(result.lowest_break_index(), Some(42));
    // At most one in-flight start per worker can race the break.
    assert!(late_starts.into_inner().len() <= 6);
}

#[test]
fn test_concurrent_breaks_report_the_minimum() {
    let config = EngineConfig::new()
        .with_max_degree_of_parallelism(8)
        .with_chunk_size(1);
    let barrier = std::sync::Barrier::new(8);

    let result = ParallelEngine::new(config)
        .unwrap()
        .for_range(0..8, &CancellationToken::none(), |i, state| {
            barrier.wait();
            state.request_break_at(100 + i * 10);
            Ok(())
        });

    assert_eq!(result.status(), LoopStatus::Broken { lowest_break_index: 100 });
    assert_eq!(result.executed(), 8);
}

#[test]
fn test_cancel_before_start_executes_nothing() {
    let source = CancellationSource::new();
    source.cancel();

    let calls = AtomicU64::new(0);
    let result = engine(4).for_range(0..1_000, &source.token(), |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.status(), LoopStatus::Cancelled);
    assert!(!result.is_completed());
}

#[test]
fn test_single_worker_cancel_mid_run() {
    let source = CancellationSource::new();
    let calls = AtomicU64::new(0);

    let result = engine(1).for_each(0..1_000u32, &source.token(), |value, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        if value == 10 {
            source.cancel();
        }
        Ok(())
    });

    // The item that fired the signal finishes; nothing after it starts.
    assert_eq!(result.status(), LoopStatus::Cancelled);
    assert_eq!(result.executed(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 11);
    assert!(result.into_result().unwrap_err().is_cancelled());
}

#[test]
fn test_shared_generator_consumed_exactly_once_at_any_parallelism() {
    for workers in [1, 2, 8] {
        let mut reference = StdRng::seed_from_u64(1_000 + workers as u64);
        let mut produced: Vec<u64> = (0..1_000).map(|_| reference.gen_range(0..100_000_000)).collect();

        // A single generator behind a lock, pulled by every worker.
        let generator = Mutex::new(StdRng::seed_from_u64(1_000 + workers as u64));
        let source = (0..1_000).map(|_| generator.lock().gen_range(0..100_000_000u64));

        let consumed = Mutex::new(Vec::with_capacity(1_000));
        let result = engine(workers).for_each(source, &CancellationToken::none(), |value, _| {
            consumed.lock().push(value);
            Ok(())
        });

        assert!(result.is_completed(), "workers={workers}");
        assert_eq!(result.executed(), 1_000);

        let mut consumed = consumed.into_inner();
        consumed.sort_unstable();
        produced.sort_unstable();
        assert_eq!(consumed, produced, "workers={workers}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timer_cancellation_mid_run() {
    let source = CancellationSource::new();
    let token = source.token();
    let _timer = source.cancel_after(Duration::from_millis(30));

    let result = tokio::task::spawn_blocking(move || {
        engine(4).for_each(0..1_000_000u64, &token, |_, _| {
            std::thread::sleep(Duration::from_micros(100));
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(result.status(), LoopStatus::Cancelled);
    assert!(result.executed() < 1_000_000);
    assert!(result.into_result().unwrap_err().is_cancelled());
}

#[test]
fn test_stop_is_distinct_from_break_and_completion() {
    let result = engine(3).for_range(0..10_000, &CancellationToken::none(), |i, state| {
        if i == 0 {
            state.stop();
        }
        Ok(())
    });

    assert_eq!(result.status(), LoopStatus::Stopped);
    assert_eq!(result.lowest_break_index(), None);
    assert!(result.executed() < 10_000);
}

#[test]
fn test_break_and_failure_compose() {
    let result = engine(1).for_range(0..100, &CancellationToken::none(), |i, state| {
        if i == 10 {
            state.request_break();
            anyhow::bail!("item 10 broke and failed");
        }
        Ok(())
    });

    assert_eq!(result.status(), LoopStatus::Broken { lowest_break_index: 10 });
    assert_eq!(result.failures().len(), 1);
    assert!(result.into_result().is_err());
}

#[test]
fn test_failures_collected_without_aborting_in_flight_items() {
    let config = EngineConfig::new()
        .with_max_degree_of_parallelism(4)
        .with_chunk_size(1);
    let barrier = std::sync::Barrier::new(4);
    let finished = AtomicU64::new(0);

    let result = ParallelEngine::new(config)
        .unwrap()
        .for_range(0..4, &CancellationToken::none(), |i, _| {
            barrier.wait();
            if i % 2 == 0 {
                anyhow::bail!("even item {i}");
            }
            std::thread::sleep(Duration::from_millis(10));
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    let failed: HashSet<_> = result.failures().iter().filter_map(ParallelError::index).collect();
    assert_eq!(failed, HashSet::from([0, 2]));

    match result.into_result() {
        Err(ParallelError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate failure, got {other:?}"),
    }
}

#[test]
fn test_panics_never_escape_the_run() {
    let result = engine(4).for_range(0..100, &CancellationToken::none(), |i, _| {
        if i == 50 {
            panic!("item fifty");
        }
        Ok(())
    });

    assert!(result
        .failures()
        .iter()
        .any(|f| matches!(f, ParallelError::ItemPanicked { index: 50, .. })));
}

#[test]
fn test_every_range_item_runs_exactly_once() {
    for workers in [1, 2, 3, 8] {
        let counts: Vec<AtomicU64> = (0..2_000).map(|_| AtomicU64::new(0)).collect();

        let result = engine(workers).for_range(0..2_000, &CancellationToken::none(), |i, _| {
            counts[i as usize].fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(result.is_completed(), "workers={workers}");
        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }
}
