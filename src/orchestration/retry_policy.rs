//! # Retry Policy
//!
//! Decides what happens to a work item whose execution failed.
//!
//! ## Overview
//!
//! Every failure consumes one retry. While retries remain the item is rescheduled to
//! `now + backoff(attempt)`; the last failure turns it into an [`Incident`] and leaves it
//! unleasable until an operator resets its retries. Successful items are removed by the
//! caller, so each execution ends as exactly one of rescheduled, failed or removed.
//!
//! ## Strategies
//!
//! - **Fixed**: the same delay for every attempt
//! - **Exponential**: `base * multiplier^(attempt - 1)`, capped, with optional jitter
//! - **Intervals**: an explicit schedule such as `R5/PT5M` or `PT1M,PT10M,PT1H`

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{RetryConfig, RetryStrategyKind};
use crate::error::SchedulerError;
use crate::models::work_item::offset_millis;
use crate::models::{Incident, WorkItem};

/// Errors raised while parsing a retry interval schedule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryScheduleError {
    #[error("Retry schedule is empty")]
    Empty,
    #[error("Invalid repetition '{0}', expected R<n>/<duration>")]
    InvalidRepetition(String),
    #[error("Invalid duration '{0}', expected P[nD][T[nH][nM][nS]]")]
    InvalidDuration(String),
}

/// Parse a `P[nD][T[nH][nM][nS]]` duration into milliseconds
pub fn parse_iso_duration(value: &str) -> Result<u64, RetryScheduleError> {
    let invalid = || RetryScheduleError::InvalidDuration(value.to_string());
    let rest = value.trim().strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (rest, None),
    };

    let mut total_secs: u64 = 0;
    let mut consume = |part: &str, units: &[(char, u64)]| -> Result<(), RetryScheduleError> {
        let mut digits = String::new();
        let mut allowed = units.iter();
        for ch in part.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            // Designators must appear in order and at most once
            let factor = allowed
                .by_ref()
                .find(|(designator, _)| *designator == ch)
                .map(|(_, factor)| *factor)
                .ok_or_else(invalid)?;
            let amount: u64 = digits.parse().map_err(|_| invalid())?;
            total_secs = total_secs
                .checked_add(amount.saturating_mul(factor))
                .ok_or_else(invalid)?;
            digits.clear();
        }
        if digits.is_empty() {
            Ok(())
        } else {
            Err(invalid())
        }
    };

    consume(date_part, &[('D', 86_400)])?;
    if let Some(time) = time_part {
        consume(time, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }
    Ok(total_secs.saturating_mul(1_000))
}

/// Explicit per-attempt delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryIntervals {
    delays_millis: Vec<u64>,
}

impl RetryIntervals {
    /// Parse `R<n>/<duration>` or a comma separated list of durations
    pub fn parse(schedule: &str) -> Result<Self, RetryScheduleError> {
        let schedule = schedule.trim();
        if schedule.is_empty() {
            return Err(RetryScheduleError::Empty);
        }

        if let Some(repeated) = schedule.strip_prefix('R') {
            let (count, duration) = repeated
                .split_once('/')
                .ok_or_else(|| RetryScheduleError::InvalidRepetition(schedule.to_string()))?;
            let count: usize = count
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| RetryScheduleError::InvalidRepetition(schedule.to_string()))?;
            let delay = parse_iso_duration(duration)?;
            return Ok(Self {
                delays_millis: vec![delay; count],
            });
        }

        let delays_millis = schedule
            .split(',')
            .map(parse_iso_duration)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { delays_millis })
    }

    /// Delay for the 1-based `attempt`; the last entry repeats
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let index = (attempt.max(1) as usize - 1).min(self.delays_millis.len().saturating_sub(1));
        self.delays_millis.get(index).copied().unwrap_or(0)
    }

    /// Number of retries the schedule describes
    pub fn len(&self) -> usize {
        self.delays_millis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays_millis.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed {
        delay_millis: u64,
    },
    Exponential {
        base_delay_millis: u64,
        multiplier: f64,
        max_delay_millis: u64,
        /// Fraction of the delay added or subtracted at random (0.0 to 1.0)
        jitter: f64,
    },
    Intervals(RetryIntervals),
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_delay_millis: 10_000,
            multiplier: 2.0,
            max_delay_millis: 3_600_000,
            jitter: 0.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the 1-based `attempt`, never shorter than one millisecond
    pub fn delay_millis(&self, attempt: u32) -> u64 {
        let delay = match self {
            BackoffStrategy::Fixed { delay_millis } => *delay_millis,
            BackoffStrategy::Exponential {
                base_delay_millis,
                multiplier,
                max_delay_millis,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let exponential = *base_delay_millis as f64 * multiplier.powi(exponent);
                let capped = exponential.min(*max_delay_millis as f64).max(0.0) as u64;
                apply_jitter(capped, *jitter)
            }
            BackoffStrategy::Intervals(intervals) => intervals.delay_for_attempt(attempt),
        };
        delay.max(1)
    }
}

fn apply_jitter(delay_millis: u64, jitter: f64) -> u64 {
    let jitter_range = (delay_millis as f64 * jitter.clamp(0.0, 1.0)) as u64;
    if jitter_range == 0 {
        return delay_millis;
    }

    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(0..=jitter_range);
    if rng.gen_bool(0.5) {
        delay_millis.saturating_add(offset)
    } else {
        delay_millis.saturating_sub(offset)
    }
}

/// What a failure did to the item
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Rescheduled {
        due_date: DateTime<Utc>,
        delay_millis: u64,
    },
    Incident(Incident),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    /// The item with retries, due date, failure reason and attempt count updated
    pub updated: WorkItem,
    pub outcome: RetryOutcome,
}

impl RetryDecision {
    pub fn incident(&self) -> Option<&Incident> {
        match &self.outcome {
            RetryOutcome::Incident(incident) => Some(incident),
            RetryOutcome::Rescheduled { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.incident().is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy) -> Self {
        Self { strategy }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self, RetryScheduleError> {
        let strategy = match config.strategy {
            RetryStrategyKind::Fixed => BackoffStrategy::Fixed {
                delay_millis: config.base_delay_millis,
            },
            RetryStrategyKind::Exponential => BackoffStrategy::Exponential {
                base_delay_millis: config.base_delay_millis,
                multiplier: config.multiplier,
                max_delay_millis: config.max_delay_millis,
                jitter: config.jitter,
            },
            RetryStrategyKind::Intervals => {
                let schedule = config
                    .retry_intervals
                    .as_deref()
                    .ok_or(RetryScheduleError::Empty)?;
                BackoffStrategy::Intervals(RetryIntervals::parse(schedule)?)
            }
        };
        Ok(Self { strategy })
    }

    pub fn strategy(&self) -> &BackoffStrategy {
        &self.strategy
    }

    /// Consume one retry of `item` for a failure described by `error`
    pub fn on_failure(
        &self,
        item: &WorkItem,
        error: &str,
        now: DateTime<Utc>,
    ) -> crate::error::Result<RetryDecision> {
        let attempt = item.failed_attempts.saturating_add(1);
        let retries = item.retries_remaining.saturating_sub(1);
        let delay_millis = self.strategy.delay_millis(attempt);
        debug!(
            work_item_id = %item.id,
            attempt = attempt,
            retries_remaining = retries,
            delay_millis = delay_millis,
            "Applying retry policy"
        );
        decide(item, error, retries, delay_millis, now)
    }

    /// Failure reported by an external worker, which supplies the remaining retries and
    /// the retry delay itself
    pub fn on_reported_failure(
        item: &WorkItem,
        error: &str,
        retries: u32,
        retry_timeout_millis: u64,
        now: DateTime<Utc>,
    ) -> crate::error::Result<RetryDecision> {
        decide(item, error, retries, retry_timeout_millis, now)
    }
}

fn decide(
    item: &WorkItem,
    error: &str,
    retries: u32,
    delay_millis: u64,
    now: DateTime<Utc>,
) -> crate::error::Result<RetryDecision> {
    let mut updated = item.clone();
    updated.retries_remaining = retries;
    updated.failed_attempts = item.failed_attempts.saturating_add(1);
    updated.last_failure_reason = Some(error.to_string());
    updated.lock_owner = None;
    updated.lock_expiration_time = None;

    if retries == 0 {
        let incident = Incident::for_work_item(&updated, error, now);
        return Ok(RetryDecision {
            updated,
            outcome: RetryOutcome::Incident(incident),
        });
    }

    let due_date = offset_millis(now, delay_millis).ok_or_else(|| {
        SchedulerError::ValidationError(format!("Retry delay of {delay_millis}ms is out of range"))
    })?;
    updated.due_date = due_date;
    Ok(RetryDecision {
        updated,
        outcome: RetryOutcome::Rescheduled {
            due_date,
            delay_millis,
        },
    })
}
