//! 执行端健康度：滚动窗口指标 + 阈值判定
//!
//! `degraded` 只看最近一个样本（最坏情况，不取平均）；连接断开次数只产生告警，不影响 degraded。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MonitorSection;
use crate::core::RelayError;

/// 一次调用（或一次探活）的观测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub response_time_ms: f64,
    pub token_usage: u64,
    pub error_rate: f64,
    pub success: bool,
    pub connection_dropped: bool,
    pub timestamp: DateTime<Utc>,
}

impl HealthSample {
    pub fn success(response_time: Duration, token_usage: u64) -> Self {
        Self {
            response_time_ms: response_time.as_secs_f64() * 1000.0,
            token_usage,
            error_rate: 0.0,
            success: true,
            connection_dropped: false,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(response_time: Duration, connection_dropped: bool) -> Self {
        Self {
            response_time_ms: response_time.as_secs_f64() * 1000.0,
            token_usage: 0,
            error_rate: 1.0,
            success: false,
            connection_dropped,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthThresholds {
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub token_usage: u64,
    pub connection_drops: u32,
}

impl From<&MonitorSection> for HealthThresholds {
    fn from(cfg: &MonitorSection) -> Self {
        Self {
            response_time_ms: cfg.response_time_ms,
            error_rate: cfg.error_rate,
            token_usage: cfg.token_usage,
            connection_drops: cfg.connection_drops,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&MonitorSection::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub samples: usize,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub avg_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub avg_token_usage: f64,
    /// 窗口内失败样本占比
    pub window_error_rate: f64,
    pub connection_drops: u32,
    pub last_successful_call: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub degraded: bool,
    pub last_check: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub alerts: Vec<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded || self.status == HealthState::Degraded
    }
}

#[derive(Debug, Default)]
struct Windows {
    response_times: VecDeque<f64>,
    token_usage: VecDeque<u64>,
    error_rates: VecDeque<f64>,
    successes: VecDeque<bool>,
    drops: VecDeque<bool>,
    latest: Option<HealthSample>,
    total_calls: u64,
    failed_calls: u64,
    last_successful_call: Option<DateTime<Utc>>,
    last_status: Option<HealthStatus>,
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    window_size: usize,
    inner: Mutex<Windows>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, window_size: usize) -> Self {
        Self {
            thresholds,
            window_size: window_size.max(1),
            inner: Mutex::new(Windows::default()),
        }
    }

    pub fn from_config(cfg: &MonitorSection) -> Self {
        Self::new(HealthThresholds::from(cfg), cfg.window_size)
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn record_sample(&self, sample: HealthSample) {
        let cap = self.window_size;
        let mut w = self.lock();
        push_bounded(&mut w.response_times, sample.response_time_ms, cap);
        push_bounded(&mut w.token_usage, sample.token_usage, cap);
        push_bounded(&mut w.error_rates, sample.error_rate, cap);
        push_bounded(&mut w.successes, sample.success, cap);
        push_bounded(&mut w.drops, sample.connection_dropped, cap);

        w.total_calls += 1;
        if sample.success {
            w.last_successful_call = Some(sample.timestamp);
        } else {
            w.failed_calls += 1;
        }
        w.latest = Some(sample);
    }

    /// 心跳发现的断开：只进入断开窗口，不产生调用样本
    pub fn record_connection_drops(&self, count: u64) {
        if count == 0 {
            return;
        }
        let cap = self.window_size;
        let mut w = self.lock();
        for _ in 0..count {
            push_bounded(&mut w.drops, true, cap);
        }
        tracing::debug!("Recorded {} heartbeat connection drop(s)", count);
    }

    /// 记录一次主执行端调用；熔断拒绝没有发生远程调用，不计入样本
    pub fn observe_call<T>(&self, elapsed: Duration, tokens: u64, outcome: &Result<T, RelayError>) {
        let sample = match outcome {
            Ok(_) => HealthSample::success(elapsed, tokens),
            Err(RelayError::CircuitOpen) => return,
            Err(e) => HealthSample::failure(
                elapsed,
                matches!(e, RelayError::Connection(_) | RelayError::Timeout(_)),
            ),
        };
        self.record_sample(sample);
    }

    pub fn evaluate(&self) -> HealthStatus {
        let mut w = self.lock();
        let metrics = Self::metrics(&w);
        let mut alerts = Vec::new();

        let degraded = match &w.latest {
            Some(latest) => {
                if latest.response_time_ms > self.thresholds.response_time_ms {
                    alerts.push(format!(
                        "Response time {:.0}ms exceeds {:.0}ms",
                        latest.response_time_ms, self.thresholds.response_time_ms
                    ));
                }
                if latest.error_rate > self.thresholds.error_rate {
                    alerts.push(format!(
                        "Error rate {:.2} exceeds {:.2}",
                        latest.error_rate, self.thresholds.error_rate
                    ));
                }
                if latest.token_usage > self.thresholds.token_usage {
                    alerts.push(format!(
                        "Token usage {} exceeds {}",
                        latest.token_usage, self.thresholds.token_usage
                    ));
                }
                !alerts.is_empty()
            }
            None => false,
        };

        if self.thresholds.connection_drops > 0
            && metrics.connection_drops >= self.thresholds.connection_drops
        {
            alerts.push(format!(
                "{} connection drops in the last {} samples",
                metrics.connection_drops, metrics.samples
            ));
        }

        let status = if w.latest.is_none() {
            HealthState::Unknown
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        let health = HealthStatus {
            status,
            degraded,
            last_check: Utc::now(),
            metrics,
            alerts,
        };
        w.last_status = Some(health.clone());
        health
    }

    /// 运行一次探活；探活本身出错时判定为 Unhealthy
    pub async fn check_health<F, Fut>(&self, probe: F) -> HealthStatus
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HealthSample, RelayError>>,
    {
        match probe().await {
            Ok(sample) => {
                self.record_sample(sample);
                self.evaluate()
            }
            Err(e) => {
                tracing::error!("Health check failed: {}", e);
                let mut w = self.lock();
                let health = HealthStatus {
                    status: HealthState::Unhealthy,
                    degraded: true,
                    last_check: Utc::now(),
                    metrics: Self::metrics(&w),
                    alerts: vec![format!("Health check error: {e}")],
                };
                w.last_status = Some(health.clone());
                health
            }
        }
    }

    pub fn last_status(&self) -> Option<HealthStatus> {
        self.lock().last_status.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        Self::metrics(&self.lock())
    }

    fn metrics(w: &Windows) -> MetricsSnapshot {
        let samples = w.response_times.len();
        if samples == 0 {
            return MetricsSnapshot {
                total_calls: w.total_calls,
                failed_calls: w.failed_calls,
                connection_drops: w.drops.iter().filter(|d| **d).count() as u32,
                last_successful_call: w.last_successful_call,
                ..MetricsSnapshot::default()
            };
        }
        let n = samples as f64;
        let failures = w.successes.iter().filter(|ok| !**ok).count();

        MetricsSnapshot {
            samples,
            total_calls: w.total_calls,
            failed_calls: w.failed_calls,
            avg_response_time_ms: w.response_times.iter().sum::<f64>() / n,
            max_response_time_ms: w.response_times.iter().copied().fold(0.0, f64::max),
            avg_token_usage: w.token_usage.iter().sum::<u64>() as f64 / n,
            window_error_rate: failures as f64 / n,
            connection_drops: w.drops.iter().filter(|d| **d).count() as u32,
            last_successful_call: w.last_successful_call,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::from_config(&MonitorSection::default())
    }
}
