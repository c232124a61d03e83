//! 可观测性：日志初始化与执行端健康度

pub mod health;

pub use health::{
    HealthMonitor, HealthSample, HealthState, HealthStatus, HealthThresholds, MetricsSnapshot,
};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing 订阅器；RUST_LOG 优先，默认 info。重复调用时忽略。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
