// Retry policies and backoff schedules

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff retry policy.
///
/// The notification queue uses the jitter-free default so that retry
/// delays are exactly `[1s, 2s, 4s, 8s, 16s]` for attempts 1..=5.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Jitter factor in 0.0..=1.0; 0.1 means +/-10% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::notification()
    }
}

impl RetryPolicy {
    /// The delivery-queue policy: 5 attempts, 1s initial, 2x backoff,
    /// capped at 16s, no jitter.
    pub fn notification() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(16),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the given attempt (1-based; attempt 1 is the first retry)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);
        let capped = base.min(self.max_interval.as_secs_f64());

        let with_jitter = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(with_jitter)
    }
}

/// A fixed backoff schedule where the last entry repeats as the cap.
///
/// Used for source-database reconnection and for the agent's HTTP push
/// retries: `[10s, 30s, 1m, 2m, 5m, 5m, 5m, ...]`.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    intervals: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(intervals: Vec<Duration>) -> Self {
        assert!(!intervals.is_empty(), "schedule must not be empty");
        Self { intervals }
    }

    /// Source-database reconnect schedule, last interval repeats
    pub fn reconnect() -> Self {
        Self::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(300),
        ])
    }

    /// Delay for a 0-based attempt index; past the end, the cap repeats
    pub fn delay(&self, attempt: usize) -> Duration {
        self.intervals[attempt.min(self.intervals.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
