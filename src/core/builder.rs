//! 协调器构建器：统一的组装逻辑
//!
//! 二进制入口走 `create_coordinator`（HTTP 主执行端 + 本地监督者 + 文件持久化），
//! 测试通过 `CoordinatorBuilder` 注入替身执行端与更短的时间参数。

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;

use crate::config::{load_config, AppConfig};
use crate::core::{CircuitBreaker, ConnectionSupervisor, DualAgentCoordinator, SupervisorSettings};
use crate::executor::{HttpPrimaryExecutor, LocalSupervisor, PrimaryExecutor, SecondaryExecutor};
use crate::memory::{ContextWindow, KnowledgeStore};
use crate::observability::HealthMonitor;
use crate::story::StoryFragmenter;

pub struct CoordinatorBuilder {
    config: AppConfig,
    connection: Option<SupervisorSettings>,
    recovery_timeout: Option<Duration>,
    knowledge: Option<Arc<KnowledgeStore>>,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            connection: None,
            recovery_timeout: None,
            knowledge: None,
        }
    }

    /// 覆盖 [connection] 段推导出的连接参数
    pub fn with_connection(mut self, settings: SupervisorSettings) -> Self {
        self.connection = Some(settings);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = Some(timeout);
        self
    }

    /// 使用已打开的知识库；未指定时使用纯内存知识库
    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn build(
        self,
        primary: Arc<dyn PrimaryExecutor>,
        secondary: Arc<dyn SecondaryExecutor>,
    ) -> DualAgentCoordinator {
        let cfg = self.config;
        let settings = self
            .connection
            .unwrap_or_else(|| SupervisorSettings::from(&cfg.connection));
        let timeout = settings.timeout;
        let breaker = CircuitBreaker::new(
            cfg.circuit.failure_threshold,
            self.recovery_timeout
                .unwrap_or_else(|| cfg.circuit.recovery_timeout()),
        );
        let knowledge = self
            .knowledge
            .unwrap_or_else(|| Arc::new(KnowledgeStore::in_memory(cfg.knowledge.checkpoint_frequency)));

        DualAgentCoordinator {
            supervisor: ConnectionSupervisor::new(primary, settings),
            breaker,
            secondary,
            fragmenter: StoryFragmenter::from_config(&cfg.fragmenter),
            knowledge,
            context: Mutex::new(ContextWindow::from_config(&cfg.context)),
            health: HealthMonitor::from_config(&cfg.monitor),
            seen_drops: AtomicU64::new(0),
            endpoint: cfg.connection.endpoint.clone(),
            enable_fallback: cfg.coordinator.enable_fallback,
            timeout,
        }
    }
}

/// 按配置文件组装生产用协调器
pub async fn create_coordinator(config_path: Option<PathBuf>) -> anyhow::Result<DualAgentCoordinator> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let knowledge = KnowledgeStore::open(&cfg.knowledge)
        .await
        .with_context(|| {
            format!(
                "failed to open knowledge store at {}",
                cfg.knowledge.storage_path.display()
            )
        })?;
    let primary = HttpPrimaryExecutor::new(cfg.connection.timeout())
        .context("failed to build primary executor")?;
    let secondary = LocalSupervisor::from_config(&cfg.coordinator, &cfg.fragmenter);

    Ok(CoordinatorBuilder::new(cfg)
        .with_knowledge(Arc::new(knowledge))
        .build(Arc::new(primary), Arc::new(secondary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ScriptedPrimary, ScriptedSecondary};

    #[tokio::test]
    async fn test_builder_applies_config() {
        let mut config = AppConfig::default();
        config.connection.endpoint = "http://primary.test/api".into();
        config.circuit.failure_threshold = 2;

        let coord = CoordinatorBuilder::new(config)
            .with_recovery_timeout(Duration::from_millis(5))
            .build(Arc::new(ScriptedPrimary::new()), Arc::new(ScriptedSecondary::new()));

        assert_eq!(coord.endpoint, "http://primary.test/api");
        assert_eq!(coord.circuit().failure_threshold, 2);
        assert_eq!(coord.circuit().recovery_timeout_secs, 0.005);
        assert!(!coord.knowledge().is_persistent());
        assert!(coord.connect().await);
        coord.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_coordinator_uses_file_knowledge() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        std::fs::write(
            &config_path,
            format!(
                "[knowledge]\nstorage_path = \"{}\"\n",
                dir.path().join("kb").display().to_string().replace('\\', "/")
            ),
        )
        .unwrap();

        let coord = create_coordinator(Some(config_path)).await.unwrap();
        assert!(coord.knowledge().is_persistent());
        coord.close().await.unwrap();
        assert!(dir.path().join("kb").join("knowledge.json").exists());
    }
}
