#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::KeyValueStore;

pub const LAST_REQUEST_KEY: &str = "youtube-search-last-request";

/// Milliseconds since the Unix epoch.
pub type MillisClock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Keeps calls to the remote API at least one window apart.
///
/// The timestamp of the previous call lives in the option store so every
/// component built over the same store shares it. Clones share one gate, so
/// concurrent callers in a process take turns through the read-sleep-write
/// sequence. Separate processes over one database are not serialized.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    window: Duration,
    now: MillisClock,
    gate: Arc<Mutex<()>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(
            store,
            Duration::from_secs(1),
            Arc::new(|| Utc::now().timestamp_millis()),
        )
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, window: Duration, now: MillisClock) -> Self {
        Self {
            store,
            window,
            now,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Blocks for whatever is left of the window since the last call, then
    /// records the current call.
    pub async fn acquire(&self) {
        let _turn = self.gate.lock().await;
        let last = match self.store.get(LAST_REQUEST_KEY).await {
            Ok(value) => value.and_then(|value| value.as_i64()),
            Err(err) => {
                warn!(error = %err, "reading rate limiter state failed");
                None
            }
        };

        if let Some(last) = last {
            let elapsed = (self.now)().saturating_sub(last).max(0) as u64;
            let window = self.window.as_millis() as u64;
            if elapsed < window {
                let pause = Duration::from_millis(window - elapsed);
                debug!(pause_ms = pause.as_millis() as u64, "throttling remote call");
                tokio::time::sleep(pause).await;
            }
        }

        let stamp = Value::from((self.now)());
        if let Err(err) = self.store.set(LAST_REQUEST_KEY, &stamp, None).await {
            warn!(error = %err, "writing rate limiter state failed");
        }
    }
}

/// Limiter with an empty window, for tests that issue many calls.
#[cfg(test)]
pub(crate) fn unthrottled(store: Arc<dyn KeyValueStore>) -> RateLimiter {
    RateLimiter::with_clock(store, Duration::ZERO, Arc::new(|| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;
    use anyhow::Result;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::time::Instant;

    fn fixed_clock(at: i64) -> (MillisClock, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(at));
        let handle = now.clone();
        (Arc::new(move || now.load(Ordering::SeqCst)), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_does_not_wait() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let store = Arc::new(store);
        let (clock, _) = fixed_clock(10_000);
        let limiter = RateLimiter::with_clock(store.clone(), Duration::from_secs(1), clock);

        let started = Instant::now();
        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(store.get(LAST_REQUEST_KEY).await?, Some(Value::from(10_000)));
        Ok(())
    }

    /// A call 300ms after the previous one sleeps the remaining 700ms.
    #[tokio::test(start_paused = true)]
    async fn close_calls_sleep_for_the_remainder() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let store = Arc::new(store);
        store.set(LAST_REQUEST_KEY, &Value::from(9_700), None).await?;
        let (clock, _) = fixed_clock(10_000);
        let limiter = RateLimiter::with_clock(store, Duration::from_secs(1), clock);

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert!(started.elapsed() < Duration::from_millis(1000));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_calls_pass_straight_through() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let store = Arc::new(store);
        let (clock, now) = fixed_clock(10_000);
        let limiter = RateLimiter::with_clock(store.clone(), Duration::from_secs(1), clock);

        limiter.acquire().await;
        now.store(11_500, Ordering::SeqCst);
        let started = Instant::now();
        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(store.get(LAST_REQUEST_KEY).await?, Some(Value::from(11_500)));
        Ok(())
    }

    /// Concurrent callers sharing a limiter are spaced a full window apart.
    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_take_turns() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let store = Arc::new(store);
        store.set(LAST_REQUEST_KEY, &Value::from(9_700), None).await?;
        let origin = Instant::now();
        let clock: MillisClock =
            Arc::new(move || 10_000 + origin.elapsed().as_millis() as i64);
        let limiter = RateLimiter::with_clock(store.clone(), Duration::from_secs(1), clock);

        let first = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                limiter.acquire().await;
                origin.elapsed()
            }
        });
        let second = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                limiter.acquire().await;
                origin.elapsed()
            }
        });
        let mut finished = vec![first.await?, second.await?];
        finished.sort();

        assert_eq!(finished[0], Duration::from_millis(700));
        assert!(finished[1] - finished[0] >= Duration::from_secs(1));
        assert_eq!(store.get(LAST_REQUEST_KEY).await?, Some(Value::from(11_700)));
        Ok(())
    }
}
