use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AdmissionError, AdmissionResult};

/// Backoff between a give-up and the next admission attempt of the same query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Sleep after the first give-up.
    pub initial: Duration,
    /// Upper bound for the sleep, no matter how many attempts failed.
    pub max: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(30),
            max: Duration::from_millis(10),
            multiplier: 2,
        }
    }
}

/// Configuration for the shared schedule state and the admission loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of slots in the query log. Every concurrently coordinated query occupies one.
    pub max_query_num: usize,
    /// Max number of queries that may be available (admitted) at the same time.
    pub max_concurrent_query: usize,
    /// Max number of affected tables a single query may touch.
    pub max_affected_tables: usize,
    /// The amount of scheduler passes a waiting query may be skipped over before it reserves
    /// its tables against later arrivals.
    pub max_skip_tolerance: u32,
    /// Upper bound between two status polls of a waiting query.
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_query_num: 128,
            max_concurrent_query: 64,
            max_affected_tables: 32,
            max_skip_tolerance: 64,
            poll_interval: Duration::from_micros(30),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Rejects configurations the scheduler cannot run with.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.max_query_num == 0 {
            return Err(AdmissionError::InvalidConfig(
                "`max_query_num` must be at least 1",
            ));
        }
        if self.max_concurrent_query == 0 {
            return Err(AdmissionError::InvalidConfig(
                "`max_concurrent_query` must be at least 1",
            ));
        }
        if self.max_concurrent_query > self.max_query_num {
            return Err(AdmissionError::InvalidConfig(
                "`max_concurrent_query` may not exceed `max_query_num`",
            ));
        }
        if self.max_affected_tables == 0 {
            return Err(AdmissionError::InvalidConfig(
                "`max_affected_tables` must be at least 1",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AdmissionError::InvalidConfig(
                "`poll_interval` must be non-zero",
            ));
        }
        if self.backoff.multiplier == 0 || self.backoff.initial > self.backoff.max {
            return Err(AdmissionError::InvalidConfig(
                "`backoff` needs a non-zero multiplier and `initial <= max`",
            ));
        }
        Ok(())
    }

    /// A config tuned for fast testing.
    ///
    /// - **log:** Few slots, so capacity errors are cheap to provoke.
    /// - **backoff:** Short sleeps keep retry scenarios fast.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            max_query_num: 8,
            max_concurrent_query: 8,
            max_affected_tables: 8,
            max_skip_tolerance: 4,
            poll_interval: Duration::from_millis(1),
            backoff: BackoffConfig {
                initial: Duration::from_micros(100),
                max: Duration::from_millis(2),
                multiplier: 2,
            },
        }
    }
}
