//! Reconciliation loop primitives.
//!
//! Loops in the pod executor poll external state (container runtime,
//! control-plane connection) and must never retry forever. This crate holds
//! the small pieces that bound them:
//!
//! - [`BackoffPolicy`]: delay before the next attempt
//! - [`RetryDeadline`]: overall give-up bound for a retry loop
//! - [`FailureBudget`]: consecutive-failure tolerance per key
//!
//! # Invariants
//!
//! - A success always resets a key's consecutive count to zero
//! - Budgets and deadlines are deterministic given the same sequence of calls

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Retry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Too many consecutive failures for one key.
    #[error("{key} failed {failures} consecutive times (limit {limit})")]
    BudgetExhausted {
        key: String,
        failures: u32,
        limit: u32,
    },
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }
}

// =============================================================================
// Deadline
// =============================================================================

/// Overall bound for a retry loop, started at construction.
#[derive(Debug, Clone, Copy)]
pub struct RetryDeadline {
    started: Instant,
    limit: Duration,
}

impl RetryDeadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.limit
    }
}

// =============================================================================
// Failure budget
// =============================================================================

/// Consecutive-failure tolerance, tracked per key.
///
/// `limit` failures in a row are tolerated; the next one exhausts the
/// budget. Any success for the key resets it.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    limit: u32,
    failures: BTreeMap<String, u32>,
}

impl FailureBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            failures: BTreeMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record a failure for `key`.
    ///
    /// Returns an error once the budget is exhausted.
    pub fn record_failure(&mut self, key: &str) -> Result<u32, RetryError> {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        if *count > self.limit {
            Err(RetryError::BudgetExhausted {
                key: key.to_string(),
                failures: *count,
                limit: self.limit,
            })
        } else {
            Ok(*count)
        }
    }

    /// Record a success for `key`, resetting its count.
    pub fn record_success(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Current consecutive failures for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Default consecutive inspect failures tolerated per container.
pub const DEFAULT_FAILURE_LIMIT: u32 = 5;
