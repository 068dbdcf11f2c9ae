//! Walltime Tracking
//!
//! Tracks elapsed time against the job's granted allocation and gates
//! operations that carry a time budget. When requeue mode is active, an
//! uncoverable budget raises [`ExecError::InsufficientTime`] so the run
//! stops cleanly and checkpoints; otherwise it only warns and proceeds at
//! the operator's risk.

use std::time::Instant;

use log::warn;

use crate::config::JobConfig;
use crate::error::ExecError;

/// A walltime budget for one operation, in minutes or by configured name.
#[derive(Debug, Clone, PartialEq)]
pub enum Budget {
    /// A literal budget in minutes.
    Minutes(f64),
    /// A named budget resolved through the `walltimes` config table.
    Named(String),
}

impl Budget {
    /// Resolves the budget to minutes. An unknown name warns and resolves to
    /// none, leaving the operation ungated.
    pub fn resolve(&self, config: &JobConfig) -> Option<f64> {
        match self {
            Budget::Minutes(minutes) => Some(*minutes),
            Budget::Named(name) => {
                let value = config.walltimes.get(name).copied();
                if value.is_none() {
                    warn!("walltime budget '{}' is not defined", name);
                }
                value
            }
        }
    }
}

impl From<f64> for Budget {
    fn from(minutes: f64) -> Self {
        Budget::Minutes(minutes)
    }
}

impl From<&str> for Budget {
    fn from(name: &str) -> Self {
        Budget::Named(name.to_string())
    }
}

/// Monotonic walltime clock for one allocation, captured once at engine
/// construction.
#[derive(Debug)]
pub struct Walltime {
    started: Instant,
    limit: f64,
}

impl Walltime {
    /// Starts the clock against a limit in minutes.
    pub fn new(limit_minutes: f64) -> Self {
        Self {
            started: Instant::now(),
            limit: limit_minutes,
        }
    }

    /// Minutes elapsed since the clock started.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64() / 60.0
    }

    /// Minutes remaining in the allocation.
    pub fn remaining(&self) -> f64 {
        self.limit - self.elapsed()
    }

    /// Ensures the remaining walltime covers `budget` minutes.
    ///
    /// With requeue active this raises `InsufficientTime` so the caller stops
    /// before starting work it cannot finish; without it the shortfall is
    /// only logged.
    pub fn ensure(&self, budget: Option<f64>, requeue_active: bool) -> Result<(), ExecError> {
        let Some(budget) = budget else {
            return Ok(());
        };

        let remaining = self.remaining();
        if budget < remaining {
            return Ok(());
        }

        let message = format!("{:.2} min needed, {:.2} min remaining", budget, remaining);
        if requeue_active {
            Err(ExecError::InsufficientTime(message))
        } else {
            warn!("insufficient walltime: {}", message);
            Ok(())
        }
    }
}
