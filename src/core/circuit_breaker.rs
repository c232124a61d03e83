//! 熔断器：连续失败达到阈值后快速失败，冷却期过后放行一次试探调用
//!
//! 与连接监管相互独立，可包裹任意异步操作。状态由一把 Mutex 保护，
//! HalfOpen 时只有拿到试探名额的调用方能进入。

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CircuitSection;
use crate::core::CircuitBreakerOpen;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 失败过多，直接拒绝
    Open,
    /// 冷却结束，等待一次试探调用的结果
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// 对外展示的熔断器状态
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub recovery_timeout_secs: f64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let failure_threshold = failure_threshold.max(1);
        tracing::info!(
            failure_threshold,
            recovery_timeout_secs = recovery_timeout.as_secs_f64(),
            "Circuit breaker initialized"
        );
        Self {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(cfg: &CircuitSection) -> Self {
        Self::new(cfg.failure_threshold, cfg.recovery_timeout())
    }

    /// 在熔断保护下执行 `op`；熔断打开时不调用 `op`，直接返回 `CircuitBreakerOpen`
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitBreakerOpen>,
    {
        self.admit().map_err(E::from)?;

        // op 被取消（future 被 drop）时也要结算，否则试探名额会一直被占用
        let mut guard = Settle {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        guard.settled = true;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let s = self.lock();
        CircuitSnapshot {
            state: s.state,
            failure_count: s.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure_time: s.last_failure_at,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
        }
    }

    /// 手动复位到 Closed
    pub fn reset(&self) {
        let mut s = self.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.last_failure = None;
        s.last_failure_at = None;
        s.trial_in_flight = false;
        tracing::info!("Circuit breaker manually reset to closed");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<(), CircuitBreakerOpen> {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = s
                    .last_failure
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(false);
                if cooled {
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    tracing::info!("Circuit breaker half-open, testing service");
                    Ok(())
                } else {
                    Err(CircuitBreakerOpen)
                }
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    Err(CircuitBreakerOpen)
                } else {
                    s.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut s = self.lock();
        s.failure_count = 0;
        s.trial_in_flight = false;
        match s.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                s.state = CircuitState::Closed;
                tracing::info!("Circuit breaker closed, service recovered");
            }
            CircuitState::Open => {
                s.state = CircuitState::Closed;
                tracing::warn!("Circuit breaker closed by a call admitted before it opened");
            }
        }
    }

    fn on_failure(&self) {
        let mut s = self.lock();
        s.failure_count += 1;
        s.last_failure = Some(Instant::now());
        s.last_failure_at = Some(Utc::now());

        match s.state {
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.trial_in_flight = false;
                tracing::warn!("Circuit breaker re-opened, trial call failed");
            }
            CircuitState::Closed if s.failure_count >= self.failure_threshold => {
                s.state = CircuitState::Open;
                tracing::error!(
                    failures = s.failure_count,
                    "Circuit breaker opened after consecutive failures"
                );
            }
            _ => {}
        }
    }
}

struct Settle<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::RelayError;

    async fn fail(calls: &AtomicUsize) -> Result<(), RelayError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::Connection("refused".into()))
    }

    async fn succeed(calls: &AtomicUsize) -> Result<u32, RelayError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let err = breaker.call(|| fail(&calls)).await.unwrap_err();
            assert!(matches!(err, RelayError::Connection(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.call(|| succeed(&calls)).await.unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not invoke the op");
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        let _ = breaker.call(|| fail(&calls)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let value = breaker.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = breaker.call(|| fail(&calls)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.call(|| succeed(&calls)).await.unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slow_trial = breaker.call(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, RelayError>("trial")
        });
        let competitor = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            breaker.call(|| succeed(&calls)).await
        };
        let (trial, other) = tokio::join!(slow_trial, competitor);

        assert_eq!(trial.unwrap(), "trial");
        assert!(matches!(other.unwrap_err(), RelayError::CircuitOpen));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let attempts = (0..5).map(|_| {
            breaker.call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, RelayError>(())
            })
        });
        let results = futures_util::future::join_all(attempts).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        let _ = breaker.call(|| fail(&calls)).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        let _ = breaker.call(|| fail(&calls)).await;
        let _ = breaker.call(|| fail(&calls)).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        let calls = AtomicUsize::new(0);
        let _ = breaker.call(|| fail(&calls)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let hung = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RelayError>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), hung).await.is_err());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 2);
        assert!(snapshot.last_failure_time.is_some());
    }

    #[test]
    fn test_reset_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        {
            let mut s = breaker.lock();
            s.state = CircuitState::Open;
            s.failure_count = 4;
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
