//! Retry strategies and the retry decision applied after a failed attempt.
//!
//! A [`RetryStrategy`] maps the attempt number to a delay. [`RetryPolicy`]
//! combines it with the job's try budget: while tries remain the job goes back
//! into the due-time index at `now + delay`, otherwise it is failed for good.
//!
//! - [`Fixed`](RetryStrategy::Fixed) - Constant delay between retries
//! - [`Linear`](RetryStrategy::Linear) - Linearly increasing delays
//! - [`Exponential`](RetryStrategy::Exponential) - Exponentially increasing delays with optional jitter
//! - [`Fibonacci`](RetryStrategy::Fibonacci) - Delays following the Fibonacci sequence
//! - [`Custom`](RetryStrategy::Custom) - User-defined retry logic
//!
//! # Examples
//!
//! ```rust
//! use millwork::retry::{JitterType, RetryStrategy};
//! use std::time::Duration;
//!
//! let strategy = RetryStrategy::exponential_with_jitter(
//!     Duration::from_secs(2),
//!     1.5,
//!     Some(Duration::from_secs(5 * 60)),
//!     JitterType::Multiplicative(0.1),
//! );
//! let delay = strategy.calculate_delay(1);
//! assert!(delay >= Duration::from_millis(1800));
//! ```

use crate::{
    config::{duration_format, option_duration_format},
    job::add_duration,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// Randomness applied to a computed delay so failing jobs do not retry in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(#[serde(with = "duration_format")] Duration),

    /// `delay * (1 ± rand(0, factor))`; 0.1 keeps the delay within 90%..110%.
    Multiplicative(f64),
}

impl JitterType {
    /// Apply jitter to `delay`. The result never goes below zero.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(amount) => {
                let jitter = Duration::from_millis(rng.gen_range(0..=amount.as_millis() as u64));
                if rng.gen_bool(0.5) {
                    delay.saturating_add(jitter)
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs();
                let scale = rng.gen_range((1.0 - factor).max(0.0)..=(1.0 + factor));
                Duration::from_millis((delay.as_millis() as f64 * scale) as u64)
            }
        }
    }
}

/// Signature of a user-supplied backoff curve.
pub type CustomBackoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How long to wait before the next attempt of a failed job.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// The same delay after every failure.
    Fixed {
        #[serde(with = "duration_format")]
        delay: Duration,
    },

    /// `base + increment * attempt`, optionally capped.
    Linear {
        #[serde(with = "duration_format")]
        base: Duration,
        #[serde(with = "duration_format")]
        increment: Duration,
        #[serde(default, with = "option_duration_format")]
        max_delay: Option<Duration>,
    },

    /// `base * multiplier^(attempt - 1)`, optionally capped and jittered.
    Exponential {
        #[serde(with = "duration_format")]
        base: Duration,
        multiplier: f64,
        #[serde(default, with = "option_duration_format")]
        max_delay: Option<Duration>,
        #[serde(default)]
        jitter: Option<JitterType>,
    },

    /// `base * fib(attempt)`, optionally capped.
    Fibonacci {
        #[serde(with = "duration_format")]
        base: Duration,
        #[serde(default, with = "option_duration_format")]
        max_delay: Option<Duration>,
    },

    /// Code-defined curve; cannot be written to or read from configuration.
    #[serde(skip)]
    Custom(CustomBackoff),
}

impl RetryStrategy {
    /// Delay before the retry following failed attempt number `attempt` (1-based).
    ///
    /// ```rust
    /// use millwork::retry::RetryStrategy;
    /// use std::time::Duration;
    ///
    /// let strategy = RetryStrategy::exponential(Duration::from_secs(1), 2.0, None);
    /// assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
    /// assert_eq!(strategy.calculate_delay(3), Duration::from_secs(4));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            RetryStrategy::Fixed { delay } => *delay,

            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => cap(base.saturating_add(increment.saturating_mul(attempt)), *max_delay),

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                let delay = if factor.is_finite() && factor * base.as_secs_f64() < u64::MAX as f64
                {
                    base.mul_f64(factor)
                } else {
                    Duration::MAX
                };
                let capped = cap(delay, *max_delay);
                match jitter {
                    Some(jitter) => jitter.apply(capped),
                    None => capped,
                }
            }

            RetryStrategy::Fibonacci { base, max_delay } => {
                let fib = fibonacci(attempt).min(u32::MAX as u64) as u32;
                cap(base.saturating_mul(fib), *max_delay)
            }

            RetryStrategy::Custom(curve) => curve(attempt),
        };

        delay.max(Duration::from_millis(1))
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }

    pub fn fibonacci(base: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Fibonacci { base, max_delay }
    }

    /// Wrap a closure mapping the attempt number to a delay.
    ///
    /// ```rust
    /// use millwork::retry::RetryStrategy;
    /// use std::time::Duration;
    ///
    /// let strategy = RetryStrategy::custom(|attempt| {
    ///     if attempt <= 3 { Duration::from_secs(5) } else { Duration::from_secs(60) }
    /// });
    /// assert_eq!(strategy.calculate_delay(4), Duration::from_secs(60));
    /// ```
    pub fn custom<F>(curve: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        RetryStrategy::Custom(Arc::new(curve))
    }
}

/// Bounded exponential: 1s, 2s, 4s, ... capped at five minutes.
impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::exponential(Duration::from_secs(1), 2.0, Some(Duration::from_secs(5 * 60)))
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Fixed { delay } => f.debug_struct("Fixed").field("delay", delay).finish(),
            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("increment", increment)
                .field("max_delay", max_delay)
                .finish(),
            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            RetryStrategy::Fibonacci { base, max_delay } => f
                .debug_struct("Fibonacci")
                .field("base", base)
                .field("max_delay", max_delay)
                .finish(),
            RetryStrategy::Custom(_) => f.write_str("Custom(<function>)"),
        }
    }
}

impl PartialEq for RetryStrategy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RetryStrategy::Fixed { delay: a }, RetryStrategy::Fixed { delay: b }) => a == b,
            (
                RetryStrategy::Linear {
                    base: b1,
                    increment: i1,
                    max_delay: m1,
                },
                RetryStrategy::Linear {
                    base: b2,
                    increment: i2,
                    max_delay: m2,
                },
            ) => b1 == b2 && i1 == i2 && m1 == m2,
            (
                RetryStrategy::Exponential {
                    base: b1,
                    multiplier: x1,
                    max_delay: m1,
                    jitter: j1,
                },
                RetryStrategy::Exponential {
                    base: b2,
                    multiplier: x2,
                    max_delay: m2,
                    jitter: j2,
                },
            ) => b1 == b2 && x1 == x2 && m1 == m2 && j1 == j2,
            (
                RetryStrategy::Fibonacci {
                    base: b1,
                    max_delay: m1,
                },
                RetryStrategy::Fibonacci {
                    base: b2,
                    max_delay: m2,
                },
            ) => b1 == b2 && m1 == m2,
            (RetryStrategy::Custom(a), RetryStrategy::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

/// The `n`th Fibonacci number, saturating at `u64::MAX`.
///
/// ```rust
/// use millwork::retry::fibonacci;
///
/// assert_eq!(fibonacci(0), 0);
/// assert_eq!(fibonacci(1), 1);
/// assert_eq!(fibonacci(2), 1);
/// assert_eq!(fibonacci(6), 8);
/// ```
pub fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }

    let mut prev = 0u64;
    let mut curr = 1u64;
    for _ in 1..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    curr
}

/// What happens to a job after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter the due-time index at `due_time`.
    Retry {
        due_time: DateTime<Utc>,
        delay: Duration,
    },
    /// No tries left; the job fails terminally.
    Exhausted,
}

/// Applies a [`RetryStrategy`] within a job's try budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Decide the fate of a job whose attempt number `try_count` just failed.
    ///
    /// A delay requested by the handler replaces the strategy's delay for this
    /// attempt only; it never grants extra tries.
    pub fn decide(
        &self,
        try_count: u32,
        max_tries: u32,
        now: DateTime<Utc>,
        requested_delay: Option<Duration>,
    ) -> RetryDecision {
        if try_count >= max_tries {
            return RetryDecision::Exhausted;
        }

        let delay =
            requested_delay.unwrap_or_else(|| self.strategy.calculate_delay(try_count.max(1)));
        RetryDecision::Retry {
            due_time: add_duration(now, delay),
            delay,
        }
    }
}
