use std::time::Duration;

use thiserror::Error;

/// Rejected schedule parameters.
///
/// These are programmer errors: the fluent [`Task`](crate::Task) builders
/// panic with the same messages, while the `try_*` counterparts return them
/// for hosts that build schedules from untrusted descriptors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// `min` must be strictly below `max` for a random interval.
    #[error("random interval: min {min:?} must be strictly less than max {max:?}")]
    InvalidRandomRange { min: Duration, max: Duration },

    /// A weekly schedule with no weekdays would never fire.
    #[error("weekly schedule requires at least one weekday")]
    EmptyWeekdays,

    /// A monthly schedule with no months would never fire.
    #[error("monthly schedule requires at least one month")]
    EmptyMonths,

    /// Day-of-month outside `1..=31`.
    #[error("day of month must be within 1..=31, got {0}")]
    DayOutOfRange(u32),

    /// A bounded task must be allowed at least one run.
    #[error("a bounded task must run at least once")]
    ZeroRuns,
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
