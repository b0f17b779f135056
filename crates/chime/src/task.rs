//! Task descriptors — an async job plus a recurrence rule and an isolation
//! mode, assembled through fluent builders.
//!
//! A [`Task`] is immutable once handed to [`Scheduler::add`](crate::Scheduler::add);
//! there is no way to reconfigure it afterwards, only to delete it.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Month, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{Result, ScheduleError};
use crate::schedule::next_fire;

/// Unique task identifier, assigned at admission and never reused within a
/// scheduler's lifetime.
pub type TaskId = u64;

/// Boxed future returned by one job invocation.
pub(crate) type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The job callable: parameterless, async, fallible. The scheduler treats the
/// body as opaque — it only logs the outcome.
pub(crate) type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// When a task fires.
///
/// The variant payload carries everything that variant needs, so a task can
/// never be in a half-configured state. Descriptors serialize as internally
/// tagged JSON (`{"kind": "daily", "at": "09:00:00"}`) so host applications
/// can accept schedules from configuration or tool calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fire immediately. Combined with [`Task::forever`] this degenerates to
    /// a tight loop — see the builder docs.
    Once,
    /// Fire every `interval`, measured from the previous scheduling instant.
    Every { interval: Duration },
    /// Fire after a uniformly random delay in `[min, max)`.
    Random { min: Duration, max: Duration },
    /// Fire every day at `at`, local time.
    Daily { at: NaiveTime },
    /// Fire at `at` on each weekday in `days`, local time.
    Weekly { days: HashSet<Weekday>, at: NaiveTime },
    /// Fire at `at` on day `day` of each month in `months`, local time.
    ///
    /// A `day` past the end of a month overflows into the next month the way
    /// the host calendar normalizes it ("February 31" lands in early March).
    Monthly {
        months: HashSet<Month>,
        day: u32,
        at: NaiveTime,
    },
}

/// Concurrency contract for one task's executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Any number of runs of this task (and of other non-blocking or blocking
    /// tasks) may overlap.
    #[default]
    NonBlocking,
    /// At most one run of *this* task at a time; other tasks still mix freely.
    Blocking,
    /// The only run of any task while it holds the global gate.
    GlobalBlocking,
}

/// A schedulable unit of work.
pub struct Task {
    /// Assigned by [`Scheduler::add`](crate::Scheduler::add) — zero until then.
    pub(crate) id: TaskId,
    pub(crate) job: Job,
    pub(crate) recurrence: Recurrence,
    /// `None` means unbounded; `Some(n)` counts down to `Some(0)`.
    pub(crate) remaining: Option<u32>,
    pub(crate) isolation: Isolation,
    /// The armed one-shot timer for the next fire, if any. Owned and aborted
    /// exclusively by the dispatch loop.
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl Task {
    /// Wrap `job` in a task that fires immediately and runs forever until a
    /// builder says otherwise.
    pub fn new<F, Fut>(job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: 0,
            job: Arc::new(move || -> JobFuture { Box::pin(job()) }),
            recurrence: Recurrence::Once,
            remaining: None,
            isolation: Isolation::NonBlocking,
            timer: None,
        }
    }

    /// Run once, then self-cancel.
    ///
    /// If overridden with [`times`](Self::times) the task behaves like
    /// `every(0)` n times; with [`forever`](Self::forever) it becomes a tight
    /// loop that fires as fast as the dispatch loop can re-arm.
    pub fn once(mut self) -> Self {
        self.recurrence = Recurrence::Once;
        self.remaining = Some(1);
        self
    }

    /// Run every `interval`.
    pub fn every(mut self, interval: Duration) -> Self {
        self.recurrence = Recurrence::Every { interval };
        self
    }

    /// Run at random intervals between `min` (inclusive) and `max`
    /// (exclusive).
    ///
    /// # Panics
    /// If `min >= max`.
    pub fn random_interval(self, min: Duration, max: Duration) -> Self {
        match self.try_random_interval(min, max) {
            Ok(task) => task,
            Err(e) => panic!("{e}"),
        }
    }

    /// Checked form of [`random_interval`](Self::random_interval).
    pub fn try_random_interval(self, min: Duration, max: Duration) -> Result<Self> {
        self.try_recurrence(Recurrence::Random { min, max })
    }

    /// Run every day at `at`, local time.
    ///
    /// The past-check is strict: a task admitted at exactly `at` fires today.
    /// [`weekly`](Self::weekly) deliberately differs — see there.
    pub fn daily(mut self, at: NaiveTime) -> Self {
        self.recurrence = Recurrence::Daily { at };
        self
    }

    /// Run at `at` on each weekday in `days`, local time.
    ///
    /// Unlike [`daily`](Self::daily), the past-check is non-strict: a task
    /// admitted at exactly `at` on a scheduled weekday fires a week later,
    /// not immediately. The asymmetry is preserved for behavioral
    /// compatibility.
    ///
    /// # Panics
    /// If `days` is empty.
    pub fn weekly(self, days: HashSet<Weekday>, at: NaiveTime) -> Self {
        match self.try_weekly(days, at) {
            Ok(task) => task,
            Err(e) => panic!("{e}"),
        }
    }

    /// Checked form of [`weekly`](Self::weekly).
    pub fn try_weekly(self, days: HashSet<Weekday>, at: NaiveTime) -> Result<Self> {
        self.try_recurrence(Recurrence::Weekly { days, at })
    }

    /// Run at `at` on day `day` of each month in `months`, local time.
    ///
    /// A `day` past the end of a scheduled month overflows into the following
    /// month ("February 31" fires in early March). Observable, preserved.
    ///
    /// # Panics
    /// If `months` is empty or `day` is outside `1..=31`.
    pub fn monthly(self, months: HashSet<Month>, day: u32, at: NaiveTime) -> Self {
        match self.try_monthly(months, day, at) {
            Ok(task) => task,
            Err(e) => panic!("{e}"),
        }
    }

    /// Checked form of [`monthly`](Self::monthly).
    pub fn try_monthly(self, months: HashSet<Month>, day: u32, at: NaiveTime) -> Result<Self> {
        self.try_recurrence(Recurrence::Monthly { months, day, at })
    }

    /// Use an already-built descriptor, e.g. one deserialized from
    /// configuration or a tool call. Leaves the run budget and isolation mode
    /// untouched.
    ///
    /// # Panics
    /// On the same invalid inputs as the per-variant builders.
    pub fn with_recurrence(self, recurrence: Recurrence) -> Self {
        match self.try_recurrence(recurrence) {
            Ok(task) => task,
            Err(e) => panic!("{e}"),
        }
    }

    /// Checked form of [`with_recurrence`](Self::with_recurrence).
    pub fn try_recurrence(mut self, recurrence: Recurrence) -> Result<Self> {
        match &recurrence {
            Recurrence::Random { min, max } if min >= max => {
                return Err(ScheduleError::InvalidRandomRange {
                    min: *min,
                    max: *max,
                })
            }
            Recurrence::Weekly { days, .. } if days.is_empty() => {
                return Err(ScheduleError::EmptyWeekdays)
            }
            Recurrence::Monthly { months, .. } if months.is_empty() => {
                return Err(ScheduleError::EmptyMonths)
            }
            Recurrence::Monthly { day, .. } if !(1..=31).contains(day) => {
                return Err(ScheduleError::DayOutOfRange(*day))
            }
            _ => {}
        }
        self.recurrence = recurrence;
        Ok(self)
    }

    /// Limit the task to `n` runs, after which it self-cancels.
    ///
    /// # Panics
    /// If `n` is zero.
    pub fn times(self, n: u32) -> Self {
        match self.try_times(n) {
            Ok(task) => task,
            Err(e) => panic!("{e}"),
        }
    }

    /// Checked form of [`times`](Self::times).
    pub fn try_times(mut self, n: u32) -> Result<Self> {
        if n == 0 {
            return Err(ScheduleError::ZeroRuns);
        }
        self.remaining = Some(n);
        Ok(self)
    }

    /// Run indefinitely. This is the default; it exists to override variants
    /// that bound themselves, such as [`once`](Self::once).
    pub fn forever(mut self) -> Self {
        self.remaining = None;
        self
    }

    /// Allow runs of this task to overlap freely. The default.
    pub fn non_blocking(mut self) -> Self {
        self.isolation = Isolation::NonBlocking;
        self
    }

    /// Serialize runs of this task against each other.
    pub fn blocking(mut self) -> Self {
        self.isolation = Isolation::Blocking;
        self
    }

    /// Make each run of this task the only thing the scheduler executes.
    pub fn global_blocking(mut self) -> Self {
        self.isolation = Isolation::GlobalBlocking;
        self
    }

    /// Consume one run slot and compute the delay until the next fire.
    ///
    /// `None` retires the task: either the run budget is exhausted or the
    /// recurrence has no next occurrence. A computed instant in the past
    /// clamps to an immediate fire.
    pub(crate) fn next_delay(&mut self, now: DateTime<Local>) -> Option<Duration> {
        match self.remaining {
            Some(0) => return None,
            Some(n) => self.remaining = Some(n - 1),
            None => {}
        }
        let fire = next_fire(&self.recurrence, now, &mut rand::rng())?;
        Some((fire - now).to_std().unwrap_or_default())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("recurrence", &self.recurrence)
            .field("remaining", &self.remaining)
            .field("isolation", &self.isolation)
            .field("armed", &self.timer.is_some())
            .finish_non_exhaustive()
    }
}
