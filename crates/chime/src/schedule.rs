//! Next-fire-time evaluation.
//!
//! [`next_fire`] is a pure function of the recurrence rule, the supplied
//! `now`, and the supplied random source — it performs no I/O, so tests pin
//! all three. Run-budget bookkeeping lives on the task record
//! ([`Task::next_delay`](crate::Task)), not here.
//!
//! Two long-standing behavioral quirks are preserved on purpose:
//!
//! | Quirk | Effect |
//! |---|---|
//! | `Daily` compares strictly, `Weekly` non-strictly | at the exact scheduled instant, a daily task fires now, a weekly one in seven days |
//! | `Monthly` normalizes overflowing days | day 31 of a 30-day month fires on the 1st of the next month |

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, NaiveTime, TimeDelta};
use rand::Rng;

use crate::task::Recurrence;

/// Compute the next local firing instant for `recurrence` relative to `now`.
///
/// `None` means the rule has no next occurrence and the task should retire
/// (an empty weekday scan, an exhausted month scan, or a local instant the
/// timezone cannot represent).
pub fn next_fire(
    recurrence: &Recurrence,
    now: DateTime<Local>,
    rng: &mut impl Rng,
) -> Option<DateTime<Local>> {
    match recurrence {
        Recurrence::Once => Some(now),

        Recurrence::Every { interval } => Some(now + TimeDelta::from_std(*interval).ok()?),

        Recurrence::Random { min, max } => {
            let span = max.saturating_sub(*min);
            let offset = if span.is_zero() {
                Duration::ZERO
            } else {
                Duration::from_nanos(rng.random_range(0..span.as_nanos() as u64))
            };
            Some(now + TimeDelta::from_std(*min + offset).ok()?)
        }

        Recurrence::Daily { at } => {
            let mut next = instant_on(now.date_naive(), *at)?;
            // Strict: an exact match fires now.
            if next < now {
                next += TimeDelta::days(1);
            }
            Some(next)
        }

        Recurrence::Weekly { days, at } => {
            if days.is_empty() {
                return None;
            }
            let mut next = instant_on(now.date_naive(), *at)?;
            // Non-strict: an exact match rolls to the next scheduled day.
            if next <= now {
                next += TimeDelta::days(1);
            }
            for _ in 0..7 {
                if days.contains(&next.weekday()) {
                    return Some(next);
                }
                next += TimeDelta::days(1);
            }
            None
        }

        Recurrence::Monthly { months, day, at } => {
            if months.is_empty() || !(1..=31).contains(day) {
                return None;
            }
            let (mut year, mut month) = (now.year(), now.month());
            let today_target = month_instant(year, month, *day, *at);
            let passed = now.day() > *day
                || (now.day() == *day && today_target.is_some_and(|t| now > t));
            if passed {
                advance_month(&mut year, &mut month);
            }
            for _ in 0..12 {
                if months.iter().any(|m| m.number_from_month() == month) {
                    return month_instant(year, month, *day, *at);
                }
                advance_month(&mut year, &mut month);
            }
            None
        }
    }
}

/// `date` at `at` in the local zone. Ambiguous instants (DST fall-back)
/// resolve to the earlier offset; an instant inside a DST gap yields `None`.
fn instant_on(date: NaiveDate, at: NaiveTime) -> Option<DateTime<Local>> {
    date.and_time(at).and_local_timezone(Local).earliest()
}

/// Day `day` of `(year, month)` at `at`, built as first-of-month plus
/// `day - 1` days so an overflowing day normalizes into the following month
/// instead of failing chrono's strict constructor.
fn month_instant(year: i32, month: u32, day: u32, at: NaiveTime) -> Option<DateTime<Local>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let date = first.checked_add_days(Days::new(u64::from(day - 1)))?;
    instant_on(date, at)
}

fn advance_month(year: &mut i32, month: &mut u32) {
    *month += 1;
    if *month > 12 {
        *month = 1;
        *year += 1;
    }
}
