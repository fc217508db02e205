//! Injected time: the core never reads the system clock directly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source and sleeper. Tests drive this manually to make timeouts
/// and wall-clock caps deterministic.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Await `future` until it resolves or `limit` elapses on `clock`.
///
/// `None` means the deadline fired first. The future is polled before the
/// sleep, so an already-ready future wins against a zero-length limit.
pub async fn with_deadline<T>(
    clock: &dyn Clock,
    limit: Duration,
    future: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        value = future => Some(value),
        () = clock.sleep(limit) => None,
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn Clock) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_deadline_lets_ready_futures_through() {
        let clock = SystemClock;
        let result = with_deadline(&clock, Duration::from_millis(1), async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_deadline_fires_on_slow_futures() {
        let clock = SystemClock;
        let result = with_deadline(&clock, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        })
        .await;
        assert_eq!(result, None);
    }
}
