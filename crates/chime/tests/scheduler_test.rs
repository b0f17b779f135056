//! End-to-end scheduler scenarios on tokio's paused virtual clock: timers,
//! run budgets, isolation guarantees, deletion, and shutdown.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chime::{Scheduler, Task};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chime=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Harness {
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    runner: tokio::task::JoinHandle<()>,
}

fn start() -> Harness {
    init_tracing();
    let scheduler = Arc::new(Scheduler::new());
    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });
    Harness {
        scheduler,
        cancel,
        runner,
    }
}

impl Harness {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.runner.await.expect("dispatch loop panicked");
    }
}

/// A task whose job just bumps `count`.
fn counting(count: &Arc<AtomicU32>) -> Task {
    let count = Arc::clone(count);
    Task::new(move || {
        let count = Arc::clone(&count);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Poll `cond` every few virtual milliseconds until it holds or `budget_ms`
/// elapses.
async fn wait_until(budget_ms: u64, mut cond: impl FnMut() -> bool) {
    for _ in 0..budget_ms.div_ceil(5).max(1) {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cond(), "condition not met within {budget_ms}ms");
}

#[tokio::test(start_paused = true)]
async fn one_shot_fires_exactly_once() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    h.scheduler.add(counting(&count).once()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // No second fire, ever.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bounded_interval_fires_exactly_n_times() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    h.scheduler
        .add(counting(&count).every(Duration::from_millis(100)).times(3))
        .await;

    wait_until(500, || count.load(Ordering::SeqCst) == 3).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3, "no fourth fire");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn blocking_runs_never_overlap_themselves() {
    let h = start();
    let inflight = Arc::new(AtomicUsize::new(0));
    let max_inflight = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicU32::new(0));

    let task = Task::new({
        let inflight = Arc::clone(&inflight);
        let max_inflight = Arc::clone(&max_inflight);
        let done = Arc::clone(&done);
        move || {
            let inflight = Arc::clone(&inflight);
            let max_inflight = Arc::clone(&max_inflight);
            let done = Arc::clone(&done);
            async move {
                let n = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                max_inflight.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    })
    .every(Duration::from_millis(50))
    .blocking()
    .times(4);

    let started = tokio::time::Instant::now();
    h.scheduler.add(task).await;
    wait_until(2_000, || done.load(Ordering::SeqCst) == 4).await;

    assert_eq!(max_inflight.load(Ordering::SeqCst), 1, "runs overlapped");
    // Four serialized 200ms runs cannot finish in under 800ms.
    assert!(started.elapsed() >= Duration::from_millis(800));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_blocking_excludes_other_tasks() {
    let h = start();
    let a_inflight = Arc::new(AtomicUsize::new(0));
    let a_max = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let b_done = Arc::new(AtomicU32::new(0));

    // A: short non-blocking job, fired fast enough to overlap with itself.
    let a = Task::new({
        let a_inflight = Arc::clone(&a_inflight);
        let a_max = Arc::clone(&a_max);
        move || {
            let a_inflight = Arc::clone(&a_inflight);
            let a_max = Arc::clone(&a_max);
            async move {
                let n = a_inflight.fetch_add(1, Ordering::SeqCst) + 1;
                a_max.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                a_inflight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    })
    .every(Duration::from_millis(10));

    // B: global-blocking job that must observe zero A-executions in flight.
    let b = Task::new({
        let a_inflight = Arc::clone(&a_inflight);
        let violations = Arc::clone(&violations);
        let b_done = Arc::clone(&b_done);
        move || {
            let a_inflight = Arc::clone(&a_inflight);
            let violations = Arc::clone(&violations);
            let b_done = Arc::clone(&b_done);
            async move {
                if a_inflight.load(Ordering::SeqCst) != 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                if a_inflight.load(Ordering::SeqCst) != 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                b_done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    })
    .every(Duration::from_millis(50))
    .global_blocking()
    .times(2);

    h.scheduler.add(a).await;
    h.scheduler.add(b).await;
    wait_until(2_000, || b_done.load(Ordering::SeqCst) == 2).await;

    assert_eq!(violations.load(Ordering::SeqCst), 0, "A ran inside B's window");
    assert!(
        a_max.load(Ordering::SeqCst) >= 2,
        "non-blocking runs should overlap freely"
    );
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn delete_before_fire_suppresses_execution() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    let id = h
        .scheduler
        .add(counting(&count).every(Duration::from_millis(200)))
        .await;

    // Let the admission land, then delete well before the first fire.
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.scheduler.delete(id).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn delete_of_unknown_id_is_harmless() {
    let h = start();
    h.scheduler.delete(4096).await;
    h.scheduler.delete(4096).await;

    let count = Arc::new(AtomicU32::new(0));
    h.scheduler.add(counting(&count).once()).await;
    wait_until(200, || count.load(Ordering::SeqCst) == 1).await;
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ids_are_monotonic() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.scheduler.add(counting(&count).once()).await);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not monotonic: {ids:?}");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_job_does_not_cancel_future_fires() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    let task = Task::new({
        let count = Arc::clone(&count);
        move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("flaky downstream"))
            }
        }
    })
    .every(Duration::from_millis(50))
    .times(2);

    h.scheduler.add(task).await;
    wait_until(500, || count.load(Ordering::SeqCst) == 2).await;
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn panicking_job_leaves_the_scheduler_alive() {
    let h = start();
    h.scheduler
        .add(Task::new(|| async { panic!("job blew up") }).once())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let count = Arc::new(AtomicU32::new(0));
    h.scheduler.add(counting(&count).once()).await;
    wait_until(200, || count.load(Ordering::SeqCst) == 1).await;
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_suppresses_pending_fires() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    h.scheduler
        .add(counting(&count).every(Duration::from_millis(50)))
        .await;
    wait_until(500, || count.load(Ordering::SeqCst) >= 2).await;

    h.scheduler.stop();
    h.runner.await.expect("dispatch loop panicked");

    let after_stop = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(start_paused = true)]
async fn add_after_stop_is_dropped() {
    let h = start();
    h.scheduler.stop();
    h.runner.await.expect("dispatch loop panicked");

    let count = Arc::new(AtomicU32::new(0));
    let id = h.scheduler.add(counting(&count).once()).await;
    assert!(id > 0, "ids keep being assigned even when dropped");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn interleaved_add_and_delete_stress() {
    let h = start();
    let count = Arc::new(AtomicU32::new(0));
    for i in 0..20u64 {
        let id = h.scheduler.add(counting(&count).once()).await;
        // Even ids race a deletion against their own immediate fire; either
        // outcome is legal. The bogus ids must always be no-ops.
        if i % 2 == 0 {
            h.scheduler.delete(id).await;
        }
        h.scheduler.delete(10_000 + i).await;
    }

    // The ten undeleted tasks must each fire exactly once; the raced ones may
    // or may not have made it to execution.
    wait_until(2_000, || count.load(Ordering::SeqCst) >= 10).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let total = count.load(Ordering::SeqCst);
    assert!((10..=20).contains(&total), "unexpected fire count {total}");

    // The loop is still live after the churn.
    let sentinel = Arc::new(AtomicU32::new(0));
    h.scheduler.add(counting(&sentinel).once()).await;
    wait_until(200, || sentinel.load(Ordering::SeqCst) == 1).await;
    h.shutdown().await;
}
