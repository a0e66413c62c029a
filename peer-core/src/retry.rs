use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CdcError;

pub const DEFAULT_MAX_FAILURES: u32 = 10;

/// Consecutive failure tracking for reader loops. Each failure waits a
/// little longer; once `max_failures` is exceeded the failure becomes fatal.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_failures: u32,
    base_delay: Duration,
    max_delay: Duration,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_FAILURES,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }
}

impl Backoff {
    pub fn new(max_failures: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_failures,
            base_delay,
            max_delay,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    fn delay(&self) -> Duration {
        let factor = 1u32 << self.failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Records a failure and sleeps before the next attempt. Returns an
    /// error once the budget is spent. Cancellation cuts the sleep short.
    pub async fn failed(
        &mut self,
        err: &anyhow::Error,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.failures += 1;
        if self.failures > self.max_failures {
            return Err(CdcError::RetriesExhausted {
                attempts: self.failures,
                last: format!("{:#}", err),
            }
            .into());
        }
        let delay = self.delay();
        tracing::warn!(
            "attempt {} of {} failed, retrying in {:?}: {:#}",
            self.failures,
            self.max_failures,
            delay,
            err
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[tokio::test(start_paused = true)]
    async fn failures_become_fatal_after_the_budget() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(3, Duration::from_millis(10), Duration::from_millis(25));
        let err = anyhow::anyhow!("timeout");
        for _ in 0..3 {
            backoff.failed(&err, &cancel).await.unwrap();
        }
        let fatal = backoff.failed(&err, &cancel).await.unwrap_err();
        assert!(matches!(
            classify(&fatal),
            Some(CdcError::RetriesExhausted { attempts: 4, .. })
        ));
    }

    #[test]
    fn delays_grow_and_are_capped() {
        let mut backoff = Backoff::new(10, Duration::from_millis(10), Duration::from_millis(35));
        backoff.failures = 1;
        assert_eq!(backoff.delay(), Duration::from_millis(10));
        backoff.failures = 2;
        assert_eq!(backoff.delay(), Duration::from_millis(20));
        backoff.failures = 3;
        assert_eq!(backoff.delay(), Duration::from_millis(35));
        backoff.succeeded();
        assert_eq!(backoff.failures(), 0);
    }
}
