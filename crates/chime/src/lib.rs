//! `chime` — in-process task scheduler.
//!
//! # Overview
//!
//! Callers build a [`Task`] (an async job plus a recurrence rule and an
//! isolation mode) and hand it to a [`Scheduler`]. A single dispatch loop
//! owns the task table, arms one one-shot timer per live task, and spawns a
//! worker per fire; the worker takes the locks the task's isolation mode
//! demands and then invokes the job. Nothing is persisted — a scheduler's
//! state dies with the process.
//!
//! # Recurrence variants
//!
//! | Variant    | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `Once`     | Single immediate fire (the default run budget is one)      |
//! | `Every`    | Repeat at a fixed interval                                 |
//! | `Random`   | Repeat at a uniformly random interval in `[min, max)`      |
//! | `Daily`    | Fire at HH:MM:SS local time every day                      |
//! | `Weekly`   | Fire at HH:MM:SS local time on a set of weekdays           |
//! | `Monthly`  | Fire at HH:MM:SS local time on day N of a set of months    |
//!
//! # Isolation modes
//!
//! | Mode             | Guarantee                                            |
//! |------------------|------------------------------------------------------|
//! | `NonBlocking`    | Runs overlap freely (default)                        |
//! | `Blocking`       | At most one concurrent run of the same task          |
//! | `GlobalBlocking` | The only run of any task while it executes           |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use chime::{Scheduler, Task};
//!
//! # async fn demo() {
//! let scheduler = Arc::new(Scheduler::new());
//! let cancel = CancellationToken::new();
//! tokio::spawn({
//!     let scheduler = Arc::clone(&scheduler);
//!     let cancel = cancel.clone();
//!     async move { scheduler.run(cancel).await }
//! });
//!
//! let id = scheduler
//!     .add(
//!         Task::new(|| async {
//!             println!("tick");
//!             Ok(())
//!         })
//!         .every(Duration::from_secs(60))
//!         .blocking(),
//!     )
//!     .await;
//!
//! // Later: stop this one task, or the whole scheduler.
//! scheduler.delete(id).await;
//! cancel.cancel();
//! # }
//! ```

pub mod engine;
pub mod error;
mod locks;
pub mod schedule;
pub mod task;

pub use engine::Scheduler;
pub use error::{Result, ScheduleError};
pub use schedule::next_fire;
pub use task::{Isolation, Recurrence, Task, TaskId};
