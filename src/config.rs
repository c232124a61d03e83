//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__CIRCUIT__FAILURE_THRESHOLD=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionSection,
    pub circuit: CircuitSection,
    pub fragmenter: FragmenterSection,
    pub context: ContextSection,
    pub knowledge: KnowledgeSection,
    pub monitor: MonitorSection,
    pub coordinator: CoordinatorSection,
}

/// [connection] 段：主执行端地址、重试、超时与心跳
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub endpoint: String,
    pub max_retries: u32,
    /// 单次网络调用超时（秒）
    pub timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// 重连退避基数：第 n 次失败后等待 2^n × base
    pub backoff_base_ms: u64,
    /// 退避上限；不设则不封顶
    pub max_backoff_secs: Option<u64>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api".to_string(),
            max_retries: 3,
            timeout_secs: 30,
            heartbeat_interval_secs: 10,
            backoff_base_ms: 1000,
            max_backoff_secs: None,
        }
    }
}

impl ConnectionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn max_backoff(&self) -> Option<Duration> {
        self.max_backoff_secs.map(Duration::from_secs)
    }
}

/// [circuit] 段：熔断阈值与恢复窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl CircuitSection {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// [fragmenter] 段：故事拆分阈值（token / 任务数）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragmenterSection {
    pub max_story_size: usize,
    pub max_tasks_per_fragment: usize,
}

impl Default for FragmenterSection {
    fn default() -> Self {
        Self {
            max_story_size: 10_000,
            max_tasks_per_fragment: 10,
        }
    }
}

/// [context] 段：上下文窗口 token 预算与条目上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_tokens: usize,
    pub max_context_items: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_context_items: 1000,
        }
    }
}

/// [knowledge] 段：增量知识库的存储目录与检查点频率
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    pub storage_path: PathBuf,
    /// 每 N 次增量更新自动做一次检查点
    pub checkpoint_frequency: u64,
    pub enable_persistence: bool,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data/knowledge"),
            checkpoint_frequency: 10,
            enable_persistence: true,
        }
    }
}

/// [monitor] 段：滚动窗口大小与告警阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub window_size: usize,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub token_usage: u64,
    pub connection_drops: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            window_size: 100,
            response_time_ms: 5000.0,
            error_rate: 0.05,
            token_usage: 90_000,
            connection_drops: 3,
        }
    }
}

/// [coordinator] 段：是否启用备用执行端、预检时的故事大小上限（字符）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub enable_fallback: bool,
    pub max_task_size: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            enable_fallback: true,
            max_task_size: 5000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.connection.max_retries, 3);
        assert_eq!(cfg.connection.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.fragmenter.max_tasks_per_fragment, 10);
        assert_eq!(cfg.knowledge.checkpoint_frequency, 10);
        assert!(cfg.coordinator.enable_fallback);
        assert!(cfg.connection.max_backoff().is_none());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[circuit]\nfailure_threshold = 2\n\n[fragmenter]\nmax_tasks_per_fragment = 3\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.circuit.failure_threshold, 2);
        assert_eq!(cfg.circuit.recovery_timeout_secs, 60);
        assert_eq!(cfg.fragmenter.max_tasks_per_fragment, 3);
        assert_eq!(cfg.fragmenter.max_story_size, 10_000);
    }
}
