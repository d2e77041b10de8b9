//! Backoff strategies and a small retry helper built on them.
//!
//! # Example
//!
//! ```
//! # use jobfabrik::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500))
//!     .with_max(TimeDelta::seconds(4))
//!     .with_jitter(Jitter::Absolute(TimeDelta::milliseconds(100)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(400));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(600));
//! assert!(strategy.backoff(10) <= TimeDelta::milliseconds(4100));
//! ```
use std::{fmt::Debug, future::Future};

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given an attempt number (starting at one) returns how long to wait before retrying.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Always returns the same delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Doubles the delay with each attempt, starting from `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = 2_i64
            .checked_pow(attempt.saturating_sub(1).into())
            .and_then(|factor| self.base.num_milliseconds().checked_mul(factor))
            .map_or(TimeDelta::max_value(), TimeDelta::milliseconds);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// A random jitter proportional to the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] (before jitter) to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        let backoff = match self.jitter {
            Some(jitter) => jitter.apply_jitter(backoff),
            None => backoff,
        };
        backoff.max(TimeDelta::zero())
    }
}

/// Runs `operation` up to `max_attempts` times, sleeping between attempts as `strategy`
/// dictates. The last error is returned once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(
    strategy: &impl Strategy,
    max_attempts: u16,
    mut operation: F,
) -> Result<T, E>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let delay = strategy.backoff(attempt);
                tracing::warn!(?err, attempt, "Attempt {attempt} failed, retrying in {delay}");
                tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
