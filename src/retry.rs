//! Retry with exponential backoff for collaborator calls.
//!
//! Every generation and upload call is wrapped in [`RetryPolicy::run`]. An
//! error is retried only when it is classified as transient:
//!
//! 1. The error's own [`Retryable::retry_hint`] decides if it has an opinion
//!    (a timeout or local I/O failure says "no").
//! 2. Otherwise its display text goes through [`RetryPolicy::is_retriable_text`],
//!    the one place substring matching happens.
//!
//! Non-matching errors are returned unchanged after a single attempt.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Substrings that mark a diagnostic as a transient network or server fault.
pub const DEFAULT_RETRIABLE_ERRORS: &[&str] = &[
    "SSL",
    "ConnectionError",
    "TimeoutError",
    "NetworkError",
    "500",
    "502",
    "503",
    "504",
];

/// Errors that can tell the retry loop whether they are worth retrying.
pub trait Retryable: Display {
    /// `Some(true)`/`Some(false)` to decide; `None` to fall back to text matching.
    fn retry_hint(&self) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Each pause is the previous one times this factor. Must be finite and
    /// not negative; settings validation requires at least 1.0.
    pub backoff_factor: f64,
    pub retriable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 1.5,
            retriable_errors: DEFAULT_RETRIABLE_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Whether a diagnostic contains one of the configured transient markers.
    pub fn is_retriable_text(&self, text: &str) -> bool {
        self.retriable_errors
            .iter()
            .any(|pattern| !pattern.is_empty() && text.contains(pattern.as_str()))
    }

    fn should_retry<E: Retryable>(&self, err: &E) -> bool {
        err.retry_hint()
            .unwrap_or_else(|| self.is_retriable_text(&err.to_string()))
    }

    /// The pause before each retry: `initial_delay`, then multiplied by
    /// `backoff_factor` every time. One entry fewer than `max_attempts`.
    ///
    /// # Panics
    ///
    /// If `backoff_factor` is negative or not finite.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = self.max_attempts.max(1) as usize - 1;
        std::iter::successors(Some(self.initial_delay), move |d| {
            Some(d.mul_f64(self.backoff_factor))
        })
        .take(retries)
    }

    /// Run `op` until it succeeds, fails non-retriably, or attempts run out.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry(&err) {
                        return Err(err);
                    }
                    let Some(delay) = delays.next() else {
                        return Err(err);
                    };
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fmt;

    #[derive(Debug, PartialEq)]
    struct TextError(&'static str);

    impl fmt::Display for TextError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Retryable for TextError {}

    #[derive(Debug)]
    struct Hinted(bool);

    impl fmt::Display for Hinted {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            // Text matches a pattern so only the hint can stop retries.
            f.write_str("HTTP 503")
        }
    }

    impl Retryable for Hinted {
        fn retry_hint(&self) -> Option<bool> {
            Some(self.0)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_initial_delay(Duration::ZERO)
    }

    #[test]
    fn defaults_match_collaborator_profile() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff_factor, 1.5);
        assert!(policy.retriable_errors.iter().any(|p| p == "SSL"));
    }

    #[test]
    fn retriable_failures_then_success() {
        let policy = fast();
        for k in 0..policy.max_attempts {
            let calls = Cell::new(0);
            let result: Result<&str, TextError> = policy.run(|| {
                calls.set(calls.get() + 1);
                if calls.get() <= k {
                    Err(TextError("ConnectionError: reset by peer"))
                } else {
                    Ok("done")
                }
            });
            assert_eq!(result, Ok("done"));
            assert_eq!(calls.get(), k + 1);
        }
    }

    #[test]
    fn non_matching_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), TextError> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(TextError("invalid prompt"))
        });
        assert_eq!(result, Err(TextError("invalid prompt")));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhausted_attempts_return_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), TextError> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(TextError("502 Bad Gateway"))
        });
        assert_eq!(result, Err(TextError("502 Bad Gateway")));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn typed_hint_overrides_text() {
        let calls = Cell::new(0);
        let result: Result<(), Hinted> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(Hinted(false))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);

        let calls = Cell::new(0);
        let _: Result<(), Hinted> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(Hinted(true))
        });
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let _: Result<(), TextError> = fast().with_max_attempts(0).run(|| {
            calls.set(calls.get() + 1);
            Err(TextError("SSL handshake"))
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delays_grow_by_backoff_factor() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_secs(2))
            .with_max_attempts(4);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(
            delays,
            [
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_millis(4500)
            ]
        );
    }

    #[test]
    fn delays_apply_factor_below_one_as_given() {
        let policy = RetryPolicy {
            backoff_factor: 0.5,
            ..RetryPolicy::default()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_attempts(3)
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays, [Duration::from_secs(1), Duration::from_millis(500)]);
    }

    #[test]
    fn single_attempt_has_no_delays() {
        assert_eq!(RetryPolicy::no_retry().delays().count(), 0);
        assert_eq!(fast().with_max_attempts(0).delays().count(), 0);
    }

    #[test]
    fn text_classification_uses_configured_patterns() {
        let policy = RetryPolicy {
            retriable_errors: vec!["quota".into()],
            ..fast()
        };
        assert!(policy.is_retriable_text("quota exceeded"));
        assert!(!policy.is_retriable_text("503 Service Unavailable"));
    }
}
