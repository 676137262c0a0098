//! Backoff policies for failed jobs.
//!
//! Everything here is pure: no I/O and no clock reads. The only source of
//! nondeterminism is jitter, and callers that need determinism can pass their
//! own RNG to [`BackoffPolicy::next_delay_with`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay every attempt.
    Fixed,
    /// `base * 2^(attempts-1)`, capped.
    #[default]
    Exponential,
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the job again after this delay.
    RetryAfter(Duration),
    /// No attempts left; dead-letter the job.
    Exhausted,
}

impl RetryDecision {
    /// Returns the delay if the job should be retried.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::RetryAfter(delay) => Some(*delay),
            RetryDecision::Exhausted => None,
        }
    }

    /// Returns true if no attempts are left.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryDecision::Exhausted)
    }
}

/// Backoff policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Backoff strategy.
    #[serde(rename = "type", default)]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the delay (0.0 to 1.0), applied as +/-.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(default_base_delay_ms()))
    }
}

impl BackoffPolicy {
    /// Creates a fixed delay policy without jitter.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: 0.0,
        }
    }

    /// Creates an exponential policy capped at one hour with 10% jitter.
    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: duration_ms(base),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }

    /// Sets the maximum delay.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.max_delay_ms = duration_ms(cap);
        self
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the retry that follows failed attempt number `attempts`,
    /// without jitter.
    ///
    /// `attempts` is 1-based; zero is treated as the first attempt.
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay_ms = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exp = attempts - 1;
                let factor = if exp >= 63 { u64::MAX } else { 1u64 << exp };
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Decides whether a job that has made `attempts` attempts may run again.
    pub fn next_delay(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        self.next_delay_with(attempts, max_attempts, &mut rand::rng())
    }

    /// Same as [`next_delay`](Self::next_delay) with an explicit RNG for jitter.
    pub fn next_delay_with<R: Rng + ?Sized>(
        &self,
        attempts: u32,
        max_attempts: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = self.base_delay_for(attempts);
        if self.jitter <= 0.0 || delay.is_zero() {
            return RetryDecision::RetryAfter(delay);
        }

        let spread = delay.as_secs_f64() * self.jitter.min(1.0);
        let offset = rng.random_range(-spread..=spread);
        let cap = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let jittered = (delay.as_secs_f64() + offset).clamp(0.0, cap);

        RetryDecision::RetryAfter(Duration::from_secs_f64(jittered))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        for attempts in 1..5 {
            assert_eq!(
                policy.next_delay(attempts, 10),
                RetryDecision::RetryAfter(Duration::from_millis(500))
            );
        }
    }

    #[test]
    fn test_exponential_table() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100))
            .with_cap(Duration::from_millis(1000))
            .without_jitter();

        let cases = [
            (1, 100),
            (2, 200),
            (3, 400),
            (4, 800),
            (5, 1000),
            (6, 1000),
            (40, 1000),
        ];

        for (attempts, expected_ms) in cases {
            assert_eq!(
                policy.next_delay(attempts, 100),
                RetryDecision::RetryAfter(Duration::from_millis(expected_ms)),
                "attempts = {}",
                attempts
            );
        }
    }

    #[test]
    fn test_exhausted_at_max_attempts() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(10));

        assert!(!policy.next_delay(2, 3).is_exhausted());
        assert!(policy.next_delay(3, 3).is_exhausted());
        assert!(policy.next_delay(4, 3).is_exhausted());
        assert_eq!(policy.next_delay(3, 3).delay(), None);
    }

    #[test]
    fn test_zero_attempts_uses_base() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(250)).without_jitter();
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(250));
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1))
            .with_cap(Duration::from_secs(60))
            .without_jitter();
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1000))
            .with_cap(Duration::from_secs(60))
            .with_jitter(0.2);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let delay = policy.next_delay_with(1, 5, &mut rng).delay().unwrap();
            assert!(delay >= Duration::from_millis(800), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1200), "{:?}", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1000))
            .with_cap(Duration::from_millis(1000))
            .with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(42);

        for attempts in 1..20 {
            let delay = policy.next_delay_with(attempts, 50, &mut rng).delay().unwrap();
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_with_jitter_clamps() {
        let policy = BackoffPolicy::default().with_jitter(3.0);
        assert_eq!(policy.jitter, 1.0);
        let policy = BackoffPolicy::default().with_jitter(f64::NAN);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_deserialize_config_shape() {
        let policy: BackoffPolicy = serde_json::from_str(
            r#"{"type":"fixed","base_delay_ms":10,"max_delay_ms":10,"jitter":0.0}"#,
        )
        .unwrap();
        assert_eq!(policy, BackoffPolicy::fixed(Duration::from_millis(10)));

        let policy: BackoffPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.kind, BackoffKind::Exponential);
        assert_eq!(policy.base_delay_ms, 1000);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn prop_exponential_is_monotonic(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..10_000_000,
            attempts in 1u32..200,
        ) {
            let policy = BackoffPolicy::exponential(Duration::from_millis(base_ms))
                .with_cap(Duration::from_millis(cap_ms))
                .without_jitter();

            let current = policy.next_delay(attempts, u32::MAX).delay().unwrap();
            let next = policy.next_delay(attempts + 1, u32::MAX).delay().unwrap();

            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }

        #[test]
        fn prop_exhausted_iff_attempts_reach_max(
            attempts in 0u32..50,
            max_attempts in 0u32..50,
            jitter in 0.0f64..1.0,
        ) {
            let policy = BackoffPolicy::exponential(Duration::from_millis(10)).with_jitter(jitter);
            let decision = policy.next_delay(attempts, max_attempts);
            prop_assert_eq!(decision.is_exhausted(), attempts >= max_attempts);
        }
    }
}
