//! Cron schedules and their materialization into one-off jobs.

use crate::errors::QueueError;
use crate::queue::Queue;
use crate::schema::ScheduledJob;
use crate::util::now_millis;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{Instrument, debug, error, info_span};

/// `next_run` of a schedule whose stored expression cannot be evaluated.
///
/// Such a schedule is never due; registering its type again re-arms it.
pub(crate) const PARKED_NEXT_RUN: i64 = i64::MAX;

/// A validated cron expression.
///
/// Accepts the classic 5-field form (`minute hour day-of-month month
/// day-of-week`) and the 6-field form with a leading seconds field. The
/// 5-field form fires at second zero. `@hourly`-style shorthands are accepted
/// as well.
///
/// Days of the week are numbered `0` to `7`, where both `0` and `7` are
/// Sunday; three-letter names work too. When both day-of-month and
/// day-of-week are restricted, a day matching either of them fires.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    /// Parse and validate `expression`.
    pub fn parse(expression: &str) -> Result<Self, QueueError> {
        let trimmed = expression.trim();
        let invalid = |reason: String| QueueError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        if trimmed.starts_with('@') {
            let schedule =
                cron::Schedule::from_str(trimmed).map_err(|e| invalid(e.to_string()))?;
            return Ok(Self {
                expression: expression.to_string(),
                schedules: vec![schedule],
            });
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let [second, minute, hour, day_of_month, month, day_of_week] = match *parts.as_slice() {
            [minute, hour, day_of_month, month, day_of_week] => {
                ["0", minute, hour, day_of_month, month, day_of_week]
            }
            [second, minute, hour, day_of_month, month, day_of_week] => {
                [second, minute, hour, day_of_month, month, day_of_week]
            }
            _ => {
                let reason = format!("expected 5 or 6 fields, found {}", parts.len());
                return Err(invalid(reason));
            }
        };

        let day_of_week = translate_day_of_week(day_of_week).map_err(&invalid)?;
        let build = |day_of_month: &str, day_of_week: &str| {
            let normalized =
                format!("{second} {minute} {hour} {day_of_month} {month} {day_of_week}");
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
        };

        let schedules = if is_restricted(day_of_month) && is_restricted(&day_of_week) {
            vec![build(day_of_month, "*")?, build("*", &day_of_week)?]
        } else {
            vec![build(day_of_month, &day_of_week)?]
        };

        Ok(Self {
            expression: expression.to_string(),
            schedules,
        })
    }

    /// The expression as originally given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
            .ok_or_else(|| QueueError::NoUpcomingRun {
                expression: self.expression.clone(),
            })
    }

    /// The first occurrence strictly after `after_millis`, in epoch milliseconds.
    pub fn next_run_after(&self, after_millis: i64) -> Result<i64, QueueError> {
        let after = DateTime::from_timestamp_millis(after_millis).unwrap_or_else(Utc::now);
        Ok(self.next_after(after)?.timestamp_millis())
    }
}

impl FromStr for CronSchedule {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Rewrites a day-of-week field from cron numbering (`0`-`7`, Sunday at both
/// ends) to the `cron` crate's (`1`-`7`, Sunday first).
///
/// Numeric items are expanded to explicit day lists, so ranges ending on `7`
/// and steps keep their meaning. Items using day names pass through.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();

    for item in field.split(',') {
        if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let invalid = || format!("invalid day of week {item:?}, expected 0-7");
        let parse = |value: &str| {
            value
                .parse::<u32>()
                .ok()
                .filter(|day| *day <= 7)
                .ok_or_else(&invalid)
        };

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(&invalid)?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (parse(first)?, parse(last)?)
        } else {
            let first = parse(range)?;
            // `n/step` runs to the end of the week
            (first, if step.is_some() { first.max(6) } else { first })
        };
        if first > last {
            return Err(invalid());
        }

        let days: BTreeSet<u32> = (first..=last)
            .step_by(step.unwrap_or(1))
            .map(|day| day % 7 + 1)
            .collect();
        let days: Vec<String> = days.iter().map(u32::to_string).collect();
        items.push(days.join(","));
    }

    Ok(items.join(","))
}

/// Claims one due schedule, re-arms it and enqueues a job for it.
///
/// The schedule is re-armed before the job is added, so no other worker can
/// claim the same tick in between. Ticks missed while nobody polled are not
/// replayed: one claim yields exactly one job.
///
/// Returns the id of the materialized job, if any schedule was due.
pub(crate) async fn materialize_next_due(queue: &Queue) -> Result<Option<i64>, QueueError> {
    let Some(scheduled) = queue.get_and_mark_scheduled_job_as_processing().await? else {
        return Ok(None);
    };

    let span = info_span!(
        "scheduled_job",
        scheduled_job.id = %scheduled.id,
        scheduled_job.type = %scheduled.job_type
    );

    materialize(queue, &scheduled).instrument(span).await
}

async fn materialize(
    queue: &Queue,
    scheduled: &ScheduledJob,
) -> Result<Option<i64>, QueueError> {
    let next_run = match CronSchedule::parse(&scheduled.cron_expression)
        .and_then(|schedule| schedule.next_run_after(now_millis()))
    {
        Ok(next_run) => next_run,
        Err(error) => {
            error!("Parking scheduled job until it is registered again: {error}");
            queue
                .mark_scheduled_job_as_idle(scheduled.id, PARKED_NEXT_RUN)
                .await?;
            return Ok(None);
        }
    };
    queue.mark_scheduled_job_as_idle(scheduled.id, next_run).await?;

    let job_id = queue.add(&scheduled.job_type, &serde_json::json!({})).await?;
    debug!(job.id = %job_id, next_run, "Materialized scheduled job");

    Ok(Some(job_id))
}
