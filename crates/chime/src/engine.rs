//! The scheduler: bounded event channels in, one dispatch loop, one worker
//! task per fire.
//!
//! The dispatch loop is the single consumer of the admission, deletion, and
//! fire channels and the only writer of the task table — the table needs no
//! lock of its own. Each fire re-arms the task's one-shot timer *before*
//! handing the job to a worker, so a slow job never skews the schedule; the
//! worker acquires whatever the task's isolation mode demands and only then
//! invokes the job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::locks::LockTable;
use crate::task::{Isolation, Job, Task, TaskId};

/// Capacity of each inbound event channel; provides mild back-pressure on
/// runaway callers.
const EVENT_CAPACITY: usize = 256;

/// An in-process task scheduler.
///
/// Construct with [`new`](Self::new), hand the instance to an `Arc`, spawn
/// [`run`](Self::run) on its own task, then [`add`](Self::add) and
/// [`delete`](Self::delete) from anywhere. Dropping the scheduler without
/// cancelling `run` aborts nothing by itself — cancel the token or call
/// [`stop`](Self::stop) for an orderly shutdown.
pub struct Scheduler {
    shared: Arc<Shared>,
    add_tx: mpsc::Sender<Task>,
    del_tx: mpsc::Sender<TaskId>,
    /// Receivers, taken exactly once by [`run`](Self::run).
    inbox: Mutex<Option<Inbox>>,
    span: Span,
}

/// State reachable from timer callbacks and workers.
struct Shared {
    next_id: AtomicU64,
    /// Checked by timer callbacks so late fires after stop are dropped.
    stopped: AtomicBool,
    /// Internal stop signal; [`Scheduler::stop`] cancels it.
    stop: CancellationToken,
    locks: LockTable,
    fire_tx: mpsc::Sender<TaskId>,
}

struct Inbox {
    add_rx: mpsc::Receiver<Task>,
    del_rx: mpsc::Receiver<TaskId>,
    fire_rx: mpsc::Receiver<TaskId>,
}

impl Scheduler {
    /// Create an idle scheduler. Nothing fires until [`run`](Self::run) is
    /// driven on a dedicated task.
    pub fn new() -> Self {
        let (add_tx, add_rx) = mpsc::channel(EVENT_CAPACITY);
        let (del_tx, del_rx) = mpsc::channel(EVENT_CAPACITY);
        let (fire_tx, fire_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
                locks: LockTable::new(),
                fire_tx,
            }),
            add_tx,
            del_tx,
            inbox: Mutex::new(Some(Inbox {
                add_rx,
                del_rx,
                fire_rx,
            })),
            span: info_span!("scheduler"),
        }
    }

    /// Emit every scheduler, timer, and worker event inside `span` instead of
    /// the default `scheduler` span. Call before [`run`](Self::run).
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Queue `task` for admission and return its id.
    ///
    /// The id is assigned eagerly, so a caller may [`delete`](Self::delete)
    /// it even before the admission is processed. Never fails: admission
    /// problems are logged, not returned — callers are fire-and-forget.
    pub async fn add(&self, mut task: Task) -> TaskId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        task.id = id;
        debug!(parent: &self.span, task_id = id, "queueing task admission");
        if self.add_tx.send(task).await.is_err() {
            warn!(parent: &self.span, task_id = id, "scheduler is stopped; task dropped");
        }
        id
    }

    /// Queue a deletion for `id`. Idempotent; unknown ids are ignored.
    ///
    /// Best-effort: a fire already in flight runs to completion, only the
    /// next one is suppressed.
    pub async fn delete(&self, id: TaskId) {
        debug!(parent: &self.span, task_id = id, "queueing task deletion");
        if self.del_tx.send(id).await.is_err() {
            warn!(parent: &self.span, task_id = id, "scheduler is stopped; deletion dropped");
        }
    }

    /// Signal the dispatch loop to tear down. Idempotent, callable from
    /// anywhere; the loop itself clears the task and lock tables.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop.cancel();
        // If the loop never started there is no state to clear, but the
        // channels must still reject further admissions and deletions.
        drop(self.inbox.lock().expect("scheduler inbox poisoned").take());
    }

    /// Drive the dispatch loop until `cancel` (or [`stop`](Self::stop))
    /// fires, then tear down: abort timers, clear tables, close the event
    /// channels. Invoke on a dedicated task; a second call is a logged no-op.
    pub async fn run(&self, cancel: CancellationToken) {
        let inbox = self.inbox.lock().expect("scheduler inbox poisoned").take();
        let Some(mut inbox) = inbox else {
            warn!(parent: &self.span, "scheduler is already running or was stopped");
            return;
        };
        self.event_loop(&mut inbox, cancel)
            .instrument(self.span.clone())
            .await;
    }

    async fn event_loop(&self, inbox: &mut Inbox, cancel: CancellationToken) {
        info!("scheduler started");
        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = self.shared.stop.cancelled() => {
                    info!("scheduler stopped");
                    break;
                }
                Some(task) = inbox.add_rx.recv() => self.admit(task, &mut tasks),
                Some(id) = inbox.del_rx.recv() => self.remove(id, &mut tasks),
                Some(id) = inbox.fire_rx.recv() => self.fire(id, &mut tasks),
            }
        }
        self.teardown(&mut tasks, inbox);
    }

    /// Insert a task, create its per-task mutex, and arm its first timer —
    /// or retire it immediately when the rule yields no occurrence.
    fn admit(&self, mut task: Task, tasks: &mut HashMap<TaskId, Task>) {
        let id = task.id;
        self.shared.locks.register(id);
        debug!(task_id = id, "task added");
        match task.next_delay(Local::now()) {
            Some(delay) => {
                self.arm(&mut task, delay);
                tasks.insert(id, task);
            }
            None => {
                debug!(task_id = id, "task has no next occurrence; disposing");
                self.shared.locks.remove(id);
            }
        }
    }

    fn remove(&self, id: TaskId, tasks: &mut HashMap<TaskId, Task>) {
        if let Some(task) = tasks.remove(&id) {
            if let Some(timer) = task.timer {
                timer.abort();
            }
        }
        self.shared.locks.remove(id);
        debug!(task_id = id, "task deleted");
    }

    /// Handle one fire event: re-arm (or retire) first, then hand the job to
    /// a fresh worker.
    fn fire(&self, id: TaskId, tasks: &mut HashMap<TaskId, Task>) {
        let Some(task) = tasks.get_mut(&id) else {
            warn!(task_id = id, "fired task does not exist");
            return;
        };
        let job = Arc::clone(&task.job);
        let isolation = task.isolation;
        let rearmed = match task.next_delay(Local::now()) {
            Some(delay) => {
                self.arm(task, delay);
                true
            }
            None => false,
        };
        if !rearmed {
            debug!(task_id = id, "disposing task");
            if let Some(task) = tasks.remove(&id) {
                if let Some(timer) = task.timer {
                    timer.abort();
                }
            }
            self.shared.locks.remove(id);
        }
        self.spawn_worker(id, isolation, job);
    }

    /// Arm the one-shot timer for the next fire, replacing (and aborting) any
    /// previously armed one so each live task holds at most one.
    fn arm(&self, task: &mut Task, delay: Duration) {
        debug!(
            task_id = task.id,
            delay_ms = delay.as_millis() as u64,
            "scheduling task"
        );
        let shared = Arc::clone(&self.shared);
        let id = task.id;
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                // A late fire after stop must not reach the closed channel.
                if shared.stopped.load(Ordering::SeqCst) {
                    return;
                }
                let _ = shared.fire_tx.send(id).await;
            }
            .in_current_span(),
        );
        if let Some(old) = task.timer.replace(timer) {
            old.abort();
        }
    }

    /// Spawn the worker that takes the task's locks and invokes the job.
    fn spawn_worker(&self, id: TaskId, isolation: Isolation, job: Job) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(
            async move {
                match isolation {
                    Isolation::NonBlocking => {
                        let _gate = shared.locks.shared_gate().await;
                        run_job(id, job).await;
                    }
                    Isolation::Blocking => {
                        // Per-task mutex strictly before the global gate; the
                        // reverse order deadlocks against GlobalBlocking.
                        let Some(mutex) = shared.locks.task_mutex(id) else {
                            debug!(task_id = id, "per-task lock is gone; task was deleted");
                            return;
                        };
                        let _task_lock = mutex.lock_owned().await;
                        let _gate = shared.locks.shared_gate().await;
                        run_job(id, job).await;
                    }
                    Isolation::GlobalBlocking => {
                        let _gate = shared.locks.exclusive_gate().await;
                        run_job(id, job).await;
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn teardown(&self, tasks: &mut HashMap<TaskId, Task>, inbox: &mut Inbox) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop.cancel();
        for (_, task) in tasks.drain() {
            if let Some(timer) = task.timer {
                timer.abort();
            }
        }
        self.shared.locks.clear();
        // Reject any further admissions and deletions.
        inbox.add_rx.close();
        inbox.del_rx.close();
        inbox.fire_rx.close();
        debug!("scheduler state cleared");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke the job on its own task so a panic unwinds there, leaving the
/// worker to log it and release the locks it still holds.
async fn run_job(id: TaskId, job: Job) {
    match tokio::spawn(job().in_current_span()).await {
        Ok(Ok(())) => debug!(task_id = id, "task completed"),
        Ok(Err(error)) => error!(task_id = id, error = %error, "task returned error"),
        Err(join) => {
            if join.is_panic() {
                let payload = join.into_panic();
                let reason = payload
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(task_id = id, panic = %reason, "task panicked");
            } else {
                debug!(task_id = id, "task aborted");
            }
        }
    }
}
