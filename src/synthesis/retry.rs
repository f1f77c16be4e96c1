//! 指数退避重试

use crate::error::{PersistenceError, ProviderError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 可判定是否值得重试的错误
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }
}

impl Retryable for PersistenceError {
    fn is_transient(&self) -> bool {
        PersistenceError::is_transient(self)
    }
}

/// 重试策略
///
/// `max_retries` 是首次调用之后的额外次数，总调用次数最多 `max_retries + 1`。
/// 第 n 次重试前等待 `backoff_base * 2^(n-1)`（指数最多到 5），且不超过 `max_backoff`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// 重试结束后的结果与实际调用次数
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            ..Default::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// 第 `retry` 次重试前的等待时间（`retry` 从 1 开始）
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (retry - 1).min(5);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// 执行 `op`，瞬时错误按策略重试，致命错误立即返回
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() && attempts <= self.max_retries => {
                    let delay = self.backoff(attempts);
                    warn!(
                        label,
                        attempt = attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "⚠️ 瞬时错误，准备重试"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(1_000));
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(9), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let outcome = fast(3)
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::transient("mock", "busy"))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let outcome: Attempted<(), _> = fast(2)
            .run("test", || async { Err(ProviderError::transient("mock", "busy")) })
            .await;
        assert!(outcome.result.unwrap_err().is_transient());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let outcome: Attempted<(), _> = fast(5)
            .run("test", || async { Err(ProviderError::fatal("mock", "bad input")) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_calls_once() {
        let outcome: Attempted<(), _> = fast(0)
            .run("test", || async { Err(PersistenceError::Unavailable("down".into())) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }
}
