//! Retry policy configuration for jobs.
//!
//! A policy caps the total number of attempts and picks a backoff strategy
//! for the delay before each retry.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on any computed backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Jitter spread as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.15;

/// Errors raised by an inconsistent retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("exponential backoff base must be positive")]
    ZeroBase,

    #[error("backoff multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("max_delay ({max:?}) is shorter than the base delay ({base:?})")]
    MaxBelowBase { base: Duration, max: Duration },
}

/// Retry policy for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,

    /// Delay strategy between attempts.
    pub backoff: Backoff,

    /// Condition for when to retry.
    #[serde(default)]
    pub retry_on: RetryCondition,
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry on the next tick.
    None,

    /// The same delay before every retry.
    Fixed {
        #[serde(with = "serde_duration")]
        delay: Duration,
    },

    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    Exponential {
        #[serde(with = "serde_duration")]
        base: Duration,
        multiplier: f64,
        #[serde(default, with = "serde_opt_duration")]
        max_delay: Option<Duration>,
        #[serde(default)]
        jitter: bool,
    },
}

/// Conditions under which a job should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any failure or timeout.
    #[default]
    Always,

    /// Retry only on timeouts and errors the handler marks as transient.
    TransientOnly,

    /// Never retry, regardless of max_attempts.
    Never,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            retry_on: RetryCondition::Always,
        }
    }

    /// Retry with a fixed delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            retry_on: RetryCondition::Always,
        }
    }

    /// Retry with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                multiplier,
                max_delay: None,
                jitter: false,
            },
            retry_on: RetryCondition::Always,
        }
    }

    /// Builder: cap exponential delays.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max_delay, .. } = &mut self.backoff {
            *max_delay = Some(max);
        }
        self
    }

    /// Builder: spread exponential delays by ±15%.
    pub fn with_jitter(mut self) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = true;
        }
        self
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1 && self.retry_on != RetryCondition::Never
    }

    /// Whether another attempt may follow the failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.is_enabled() && attempt < self.max_attempts
    }

    /// Delay before retrying after the failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let cap = max_delay.unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                let delay = Duration::try_from_secs_f64(secs)
                    .unwrap_or(cap)
                    .min(cap);
                if *jitter { apply_jitter(delay) } else { delay }
            }
        }
    }

    /// Reject policies that cannot be evaluated sensibly.
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.max_attempts == 0 {
            return Err(RetryError::ZeroAttempts);
        }
        if let Backoff::Exponential {
            base,
            multiplier,
            max_delay,
            ..
        } = &self.backoff
        {
            if base.is_zero() {
                return Err(RetryError::ZeroBase);
            }
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(RetryError::InvalidMultiplier(*multiplier));
            }
            if let Some(max) = max_delay {
                if max < base {
                    return Err(RetryError::MaxBelowBase {
                        base: *base,
                        max: *max,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries.
    fn default() -> Self {
        Self::none()
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let spread = delay.as_secs_f64() * JITTER_FRACTION;
    if spread <= 0.0 {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let jittered = (delay.as_secs_f64() + offset).max(0.001);
    Duration::try_from_secs_f64(jittered).unwrap_or(delay)
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as fractional seconds (matching YAML config format).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod serde_opt_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
