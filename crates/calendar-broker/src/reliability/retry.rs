//! Backoff policy for reconnecting to the log

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff between connection attempts
///
/// Exponential with jitter, capped at `max_interval`. With no attempt limit
/// the caller keeps trying until its cancellation token fires.
///
/// # Example
///
/// ```
/// use calendar_broker::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_millis(200))
///     .with_max_interval(Duration::from_secs(10))
///     .with_max_attempts(20);
///
/// assert!(policy.has_attempts_remaining(19));
/// assert!(!policy.has_attempts_remaining(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first, `None` for unbounded
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive delays
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0), 0.1 spreads delays by ten percent either way
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Unbounded exponential backoff from 500ms up to 30s with 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: None,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Constant delay without jitter
    pub fn fixed(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after `attempt` (1-based) has failed
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .map_err(|_| S::Error::custom(format!("duration {duration:?} overflows u64 milliseconds")))?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
