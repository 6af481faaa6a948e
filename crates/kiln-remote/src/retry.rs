use crate::RemoteError;
use std::time::Duration;
use tracing::warn;

/// How often a transient transport failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        retries: 0,
        wait: Duration::ZERO,
    };

    pub fn new(retries: u32, wait: Duration) -> Self {
        Self { retries, wait }
    }

    /// Run `op`, retrying while it fails with a transient error. The last
    /// error is returned once the retries are spent.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "{what} failed ({e}); retry {attempt}/{} in {}s",
                        self.retries,
                        self.wait.as_secs()
                    );
                    if !self.wait.is_zero() {
                        std::thread::sleep(self.wait);
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn transient() -> RemoteError {
        RemoteError::Transport {
            remote: "r".to_owned(),
            reason: "reset".to_owned(),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let out = policy.run("GET", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(transient())
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn surfaces_error_after_exhausting_retries() {
        let calls = Cell::new(0);
        let out: Result<(), _> = RetryPolicy::new(1, Duration::ZERO).run("GET", || {
            calls.set(calls.get() + 1);
            Err(transient())
        });
        assert!(matches!(out, Err(RemoteError::Transport { .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn definite_errors_are_not_retried() {
        let calls = Cell::new(0);
        let out: Result<(), _> = RetryPolicy::new(5, Duration::ZERO).run("GET", || {
            calls.set(calls.get() + 1);
            Err(RemoteError::integrity("pkg", "checksum mismatch"))
        });
        assert!(matches!(out, Err(RemoteError::Integrity { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn no_retries_by_default() {
        let calls = Cell::new(0);
        let _ = RetryPolicy::default().run("GET", || -> Result<(), _> {
            calls.set(calls.get() + 1);
            Err(transient())
        });
        assert_eq!(calls.get(), 1);
    }
}
