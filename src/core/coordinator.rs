//! 双执行端协调器
//!
//! 预检 → 按需拆分 → 逐片段顺序执行（主执行端在熔断保护下，失败则降级到备用端）
//! → 每次尝试都写入知识库检查点 → 合并结果。主、备都失败时记录失败点并停止后续片段。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::core::{
    CircuitBreaker, CircuitSnapshot, ConnectionState, ConnectionSupervisor, ExecutorRole,
    FragmentFailure, FragmentReport, RelayError, StoryOutcome,
};
use crate::executor::SecondaryExecutor;
use crate::memory::{ContextSnapshot, ContextWindow, KnowledgeOp, KnowledgeStore, Priority};
use crate::observability::{HealthMonitor, HealthStatus};
use crate::story::{Fragment, Story, StoryFragmenter};

/// 主、备执行端均失败
struct AttemptFailure {
    primary: RelayError,
    secondary: Option<RelayError>,
}

pub struct DualAgentCoordinator {
    pub(crate) supervisor: ConnectionSupervisor,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) secondary: Arc<dyn SecondaryExecutor>,
    pub(crate) fragmenter: StoryFragmenter,
    pub(crate) knowledge: Arc<KnowledgeStore>,
    pub(crate) context: Mutex<ContextWindow>,
    pub(crate) health: HealthMonitor,
    /// 已转交给 health 的连接断开次数
    pub(crate) seen_drops: AtomicU64,
    pub(crate) endpoint: String,
    pub(crate) enable_fallback: bool,
    /// 预检与备用端执行的超时，与主执行端一致
    pub(crate) timeout: Duration,
}

impl DualAgentCoordinator {
    /// 连接到配置的主执行端
    pub async fn connect(&self) -> bool {
        self.supervisor.connect(&self.endpoint).await
    }

    /// 执行一个故事。只有预检失败会返回错误；执行失败体现在 `StoryOutcome::status` 中
    pub async fn execute_story(&self, story: &Story) -> Result<StoryOutcome, RelayError> {
        if story.id.trim().is_empty() {
            return Err(RelayError::Validation("story has no id".to_string()));
        }
        let validation =
            match tokio::time::timeout(self.timeout, self.secondary.validate_story(story)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::error!("Validation of story {} timed out", story.id);
                    return Err(RelayError::Timeout(self.timeout));
                }
            };
        if !validation.valid {
            let notes = validation
                .notes
                .unwrap_or_else(|| "rejected by validator".to_string());
            tracing::error!("Story {} failed validation: {}", story.id, notes);
            return Err(RelayError::Validation(notes));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "Executing story {} (run {}, ~{} tokens)",
            story.id,
            run_id,
            validation.estimated_tokens
        );

        {
            let mut context = self.context();
            for (criterion, value) in &story.acceptance_criteria {
                let mut item = Map::new();
                item.insert(criterion.clone(), value.clone());
                context.add(Value::Object(item), Priority::Critical);
            }
        }

        let units = if validation.requires_decomposition {
            self.fragmenter.fragment(story).into_fragments()
        } else {
            vec![Fragment::whole(story)]
        };
        tracing::info!("Story {} runs as {} unit(s)", story.id, units.len());

        let mut completed = Vec::with_capacity(units.len());
        let mut failure = None;

        for (index, unit) in units.iter().enumerate() {
            match self.run_fragment(unit).await {
                Ok(report) => {
                    self.checkpoint_fragment(&run_id, unit, Ok(&report)).await;
                    self.context().add(report.result.clone(), Priority::Normal);
                    completed.push(report);
                }
                Err(attempt) => {
                    let blocked: Vec<String> =
                        units[index + 1..].iter().map(|f| f.id.clone()).collect();
                    let fragment_failure = FragmentFailure {
                        fragment_id: unit.id.clone(),
                        ordinal: unit.ordinal,
                        primary_error: attempt.primary.to_string(),
                        secondary_error: attempt.secondary.as_ref().map(|e| e.to_string()),
                        blocked,
                    };
                    tracing::error!(
                        "Fragment {} failed on both executors ({}), blocking {} later fragment(s)",
                        unit.id,
                        fragment_failure.reason(),
                        fragment_failure.blocked.len()
                    );
                    self.checkpoint_fragment(&run_id, unit, Err(&fragment_failure))
                        .await;
                    failure = Some(fragment_failure);
                    break;
                }
            }
        }

        self.sync_heartbeat_drops();
        let health = self.health.evaluate();
        if health.degraded {
            tracing::warn!("Primary executor degraded: {}", health.alerts.join("; "));
        }

        let outcome = StoryOutcome::merge(&story.id, run_id, completed, failure);
        tracing::info!(
            "Story {} finished with status {:?} ({} completed)",
            story.id,
            outcome.status,
            outcome.total_subtasks
        );
        Ok(outcome)
    }

    async fn run_fragment(&self, unit: &Fragment) -> Result<FragmentReport, AttemptFailure> {
        self.sync_heartbeat_drops();
        let started = Instant::now();
        let primary = self
            .breaker
            .call(|| self.supervisor.execute_task(unit))
            .await;
        // 调用自身造成的断开已由样本记录
        self.seen_drops
            .store(self.supervisor.connection_drops(), Ordering::SeqCst);
        self.health.observe_call(
            started.elapsed(),
            unit.metadata.estimated_tokens as u64,
            &primary,
        );

        let primary_error = match primary {
            Ok(result) => {
                tracing::debug!("Fragment {} executed by primary", unit.id);
                return Ok(FragmentReport {
                    fragment_id: unit.id.clone(),
                    ordinal: unit.ordinal,
                    executed_by: ExecutorRole::Primary,
                    fallback_reason: None,
                    result,
                });
            }
            Err(e) => e,
        };

        if !self.enable_fallback {
            return Err(AttemptFailure {
                primary: primary_error,
                secondary: None,
            });
        }

        tracing::warn!(
            "Primary failed for {} ({}), falling back to secondary",
            unit.id,
            primary_error
        );
        let secondary =
            match tokio::time::timeout(self.timeout, self.secondary.execute_task(unit)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::Timeout(self.timeout)),
            };

        match secondary {
            Ok(result) => Ok(FragmentReport {
                fragment_id: unit.id.clone(),
                ordinal: unit.ordinal,
                executed_by: ExecutorRole::Secondary,
                fallback_reason: Some(primary_error.to_string()),
                result,
            }),
            Err(e) => Err(AttemptFailure {
                primary: primary_error,
                secondary: Some(e),
            }),
        }
    }

    /// 以 `+<fragment_id>` 写入一次尝试的记录；失败只记日志，不影响执行链
    async fn checkpoint_fragment(
        &self,
        run_id: &str,
        unit: &Fragment,
        attempt: Result<&FragmentReport, &FragmentFailure>,
    ) {
        let mut entry = json!({
            "run_id": run_id,
            "story_id": unit.story_id,
            "fragment": unit,
            "timestamp": Utc::now(),
        });
        match attempt {
            Ok(report) => {
                entry["status"] = json!("success");
                entry["executed_by"] = json!(report.executed_by);
                entry["result"] = report.result.clone();
            }
            Err(failure) => {
                entry["status"] = json!("failed");
                entry["error"] = json!(failure);
            }
        }

        let op = KnowledgeOp::Add {
            key: unit.id.clone(),
            value: entry,
        };
        match self.knowledge.apply_incremental(vec![op]).await {
            Ok(update_id) => tracing::info!("Checkpoint saved for {} (update {})", unit.id, update_id),
            Err(e) => tracing::error!("Failed to checkpoint {}: {}", unit.id, e),
        }
    }

    /// 关闭连接监管（等待心跳退出）并写入最终检查点
    pub async fn close(&self) -> Result<(), RelayError> {
        self.supervisor.close().await;
        self.knowledge.checkpoint().await?;
        tracing::info!("Dual agent coordinator closed");
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.supervisor.state().await
    }

    pub fn connection_drops(&self) -> u64 {
        self.supervisor.connection_drops()
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        self.sync_heartbeat_drops();
        self.health.evaluate()
    }

    pub fn context_snapshot(&self) -> ContextSnapshot {
        self.context().snapshot()
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn fragmenter(&self) -> &StoryFragmenter {
        &self.fragmenter
    }

    /// 把心跳发现、尚未转交的断开计入 health
    fn sync_heartbeat_drops(&self) {
        let total = self.supervisor.connection_drops();
        let seen = self.seen_drops.swap(total, Ordering::SeqCst);
        self.health
            .record_connection_drops(total.saturating_sub(seen));
    }

    fn context(&self) -> MutexGuard<'_, ContextWindow> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
