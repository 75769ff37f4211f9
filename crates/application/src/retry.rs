use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}

/// 写操作的重试策略，`max_attempts` 包含首次执行
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::exponential(base),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(10))
    }
}

/// 重复执行 `op`，直到成功、遇到不可重试的错误或次数用尽
pub async fn retry_async<F, Fut, T, E, P>(config: &RetryConfig, is_retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = config.backoff.delay_at(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "操作失败，准备重试");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays() {
        let backoff = Backoff::exponential(Duration::from_millis(10));
        assert_eq!(backoff.delay_at(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_at(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_at(4), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig::new(5, Duration::from_millis(1));
        let result: Result<u32, String> = retry_async(&config, |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("conflict #{n}"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn stops_on_non_retryable_or_exhaustion() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let result: Result<(), String> = retry_async(&config, |e: &String| e != "fatal", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let result: Result<(), String> = retry_async(&config, |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("busy".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
