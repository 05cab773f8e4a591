use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::EtlError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Bounded fixed-delay retry around a fallible call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub retryable: fn(&EtlError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
            retryable: EtlError::is_transient,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            ..Self::default()
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` calls have failed. `op` receives the 1-based attempt.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, EtlError>
    where
        F: FnMut(u32) -> Result<T, EtlError>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if (self.retryable)(&err) => {
                    warn!(
                        "{label}: {err} on try {attempt}/{}",
                        self.max_attempts
                    );
                    if attempt >= self.max_attempts {
                        warn!("{label}: failed {attempt} times, giving up");
                        return Err(EtlError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(10, Duration::ZERO)
    }

    #[test]
    fn succeeds_on_the_tenth_attempt() {
        let mut calls = 0;
        let result = policy().run("fetch", |_| {
            calls += 1;
            if calls < 10 {
                Err(EtlError::ConnectionReset("reset".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 10);
    }

    #[test]
    fn gives_up_after_ten_without_an_eleventh_call() {
        let mut calls = 0;
        let result: Result<(), _> = policy().run("fetch", |_| {
            calls += 1;
            Err(EtlError::ConnectionReset("reset".to_string()))
        });
        assert_eq!(calls, 10);
        assert_matches!(result, Err(EtlError::RetriesExhausted { attempts: 10, .. }));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = policy().run("fetch", |_| {
            calls += 1;
            Err(EtlError::ArchiveStatus {
                status: 404,
                message: "missing".to_string(),
            })
        });
        assert_eq!(calls, 1);
        assert_matches!(result, Err(EtlError::ArchiveStatus { status: 404, .. }));
    }
}
