//! # Acquisition Wait Strategy
//!
//! Decides how long the job executor sleeps between acquisition cycles.
//!
//! - a full batch means more work is probably waiting: no wait
//! - an empty cycle grows the idle wait geometrically up to `max_wait_in_millis`
//! - lost races grow a separate backoff level so competing nodes spread out; it shrinks
//!   again after `backoff_decrease_threshold` race-free cycles
//! - a failed cycle waits the base interval

use std::time::Duration;
use tracing::debug;

use crate::config::JobAcquisitionConfig;

/// What the last cycle observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        acquired: usize,
        requested: usize,
        lost_races: usize,
    },
    Failed,
}

#[derive(Debug, Clone)]
pub struct AcquisitionStrategy {
    config: JobAcquisitionConfig,
    idle_level: u32,
    backoff_level: u32,
    race_free_cycles: u32,
}

impl AcquisitionStrategy {
    pub fn new(config: JobAcquisitionConfig) -> Self {
        Self {
            config,
            idle_level: 0,
            backoff_level: 0,
            race_free_cycles: 0,
        }
    }

    pub fn backoff_level(&self) -> u32 {
        self.backoff_level
    }

    pub fn idle_level(&self) -> u32 {
        self.idle_level
    }

    fn backoff_enabled(&self) -> bool {
        self.config.backoff_time_in_millis > 0
    }

    fn scaled(&self, base: u64, level: u32, cap: u64) -> Duration {
        let exponent = level.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = base as f64 * self.config.wait_increase_factor.powi(exponent);
        Duration::from_millis(millis.min(cap as f64).max(0.0) as u64)
    }

    /// Record `outcome` and return the wait before the next cycle
    pub fn next_wait(&mut self, outcome: CycleOutcome) -> Duration {
        let base_wait = Duration::from_millis(self.config.wait_time_in_millis);

        let (acquired, requested, lost_races) = match outcome {
            CycleOutcome::Failed => return base_wait,
            CycleOutcome::Completed {
                acquired,
                requested,
                lost_races,
            } => (acquired, requested, lost_races),
        };

        if self.backoff_enabled() {
            if lost_races > 0 {
                self.backoff_level += 1;
                self.race_free_cycles = 0;
                let wait = self.scaled(
                    self.config.backoff_time_in_millis,
                    self.backoff_level,
                    self.config.max_backoff_in_millis.max(self.config.backoff_time_in_millis),
                );
                debug!(
                    backoff_level = self.backoff_level,
                    wait_ms = wait.as_millis() as u64,
                    "Backing off after lost races"
                );
                return wait;
            }

            self.race_free_cycles += 1;
            if self.backoff_level > 0
                && self.race_free_cycles >= self.config.backoff_decrease_threshold
            {
                self.backoff_level -= 1;
                self.race_free_cycles = 0;
            }
        }

        if acquired == 0 {
            self.idle_level += 1;
            return self.scaled(
                self.config.wait_time_in_millis,
                self.idle_level,
                self.config.max_wait_in_millis,
            );
        }

        self.idle_level = 0;
        if acquired >= requested && self.backoff_level == 0 {
            Duration::ZERO
        } else if acquired >= requested {
            self.scaled(
                self.config.backoff_time_in_millis,
                self.backoff_level,
                self.config.max_backoff_in_millis.max(self.config.backoff_time_in_millis),
            )
        } else {
            base_wait
        }
    }
}
