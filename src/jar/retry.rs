//! Retry wrapper around document-store traversals.
//!
//! Transient backing-store failures (network, 5xx-class trouble) are
//! retried with exponential backoff and **no attempt bound**: the
//! system has no latency SLA for individual cookies, so waiting out an
//! outage beats surfacing it. Domain errors (not-found, conflict) pass
//! straight through to the caller.
//!
//! The policy can be disabled so real errors surface on the first
//! attempt; debug builds disable it by default.

use std::time::Duration;

use log::warn;

use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// When `false` the first error of any kind is returned unchanged.
    pub enabled: bool,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the doubling backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: !cfg!(debug_assertions),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Runs `op` until it succeeds or fails non-transiently.
    ///
    /// `what` names the operation in the retry log line.
    pub fn run<R>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut delay = self.initial_delay;
        let mut attempt: u64 = 0;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if self.enabled && e.is_transient() => {
                    attempt += 1;
                    warn!("{what} failed ({e}); retry #{attempt} in {delay:?}");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let mut left = 3;
        let out = fast().run("op", || {
            if left > 0 {
                left -= 1;
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(out.unwrap(), 42);
    }

    #[test]
    fn domain_errors_are_never_retried() {
        let mut calls = 0;
        let out: Result<(), _> = fast().run("op", || {
            calls += 1;
            Err(StoreError::Conflict)
        });
        assert!(matches!(out, Err(StoreError::Conflict)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn disabled_policy_surfaces_the_first_error() {
        let mut calls = 0;
        let out: Result<(), _> = RetryPolicy::disabled().run("op", || {
            calls += 1;
            Err(StoreError::Unavailable("down".into()))
        });
        assert!(matches!(out, Err(StoreError::Unavailable(_))));
        assert_eq!(calls, 1);
    }
}
