//! 增量知识库：只追加的增量日志 + 周期性检查点 + 按时间点回滚
//!
//! 日志是事实来源，键值表只是物化缓存，总能从最近的检查点重放日志得到。
//! 增量键前缀在写入时一次性解码：`+key` 添加，`-key` 删除，`~key` 合并，裸 `key` 赋值。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::KnowledgeSection;
use crate::core::RelayError;
use crate::memory::{FileLogSink, LogSink};

/// 单个键上的操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KnowledgeOp {
    Set { key: String, value: Value },
    Add { key: String, value: Value },
    Remove { key: String },
    /// 两侧都是对象时按字段合并，否则替换；键不存在时不做任何事
    Merge { key: String, value: Value },
}

impl KnowledgeOp {
    /// 按前缀约定解码一条原始增量
    pub fn decode(raw_key: &str, value: Value) -> Self {
        if let Some(key) = raw_key.strip_prefix('+') {
            KnowledgeOp::Add {
                key: key.to_string(),
                value,
            }
        } else if let Some(key) = raw_key.strip_prefix('-') {
            KnowledgeOp::Remove {
                key: key.to_string(),
            }
        } else if let Some(key) = raw_key.strip_prefix('~') {
            KnowledgeOp::Merge {
                key: key.to_string(),
                value,
            }
        } else {
            KnowledgeOp::Set {
                key: raw_key.to_string(),
                value,
            }
        }
    }

    pub fn decode_map(delta: Map<String, Value>) -> Vec<Self> {
        delta
            .into_iter()
            .map(|(raw_key, value)| Self::decode(&raw_key, value))
            .collect()
    }

    pub fn key(&self) -> &str {
        match self {
            KnowledgeOp::Set { key, .. }
            | KnowledgeOp::Add { key, .. }
            | KnowledgeOp::Remove { key }
            | KnowledgeOp::Merge { key, .. } => key,
        }
    }

    fn apply(&self, knowledge: &mut Map<String, Value>) {
        match self {
            KnowledgeOp::Set { key, value } | KnowledgeOp::Add { key, value } => {
                knowledge.insert(key.clone(), value.clone());
            }
            KnowledgeOp::Remove { key } => {
                knowledge.remove(key);
            }
            KnowledgeOp::Merge { key, value } => {
                let Some(existing) = knowledge.get_mut(key) else {
                    return;
                };
                let merged = match (existing.as_object_mut(), value.as_object()) {
                    (Some(current), Some(update)) => {
                        for (field, v) in update {
                            current.insert(field.clone(), v.clone());
                        }
                        true
                    }
                    _ => false,
                };
                if !merged {
                    *existing = value.clone();
                }
            }
        }
    }
}

/// 日志中的一条增量，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDelta {
    pub update_id: u64,
    pub ops: Vec<KnowledgeOp>,
    pub timestamp: DateTime<Utc>,
}

/// 检查点：id 小于 `boundary` 的增量都已折叠进 `knowledge`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub boundary: u64,
    pub taken_at: DateTime<Utc>,
    pub knowledge: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStats {
    pub total_entries: usize,
    pub total_updates: u64,
    pub delta_log_size: usize,
    pub checkpoint_count: usize,
    pub last_checkpoint: Option<u64>,
    pub last_update: Option<DateTime<Utc>>,
    pub archived_before: u64,
    pub persistent: bool,
}

/// 写入 sink 的完整镜像
#[derive(Serialize)]
struct ImageRef<'a> {
    checkpoints: &'a [Checkpoint],
    log: &'a [KnowledgeDelta],
    next_update_id: u64,
    archived_before: u64,
}

#[derive(Deserialize)]
struct Image {
    #[serde(default)]
    checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    log: Vec<KnowledgeDelta>,
    next_update_id: u64,
    #[serde(default)]
    archived_before: u64,
}

#[derive(Debug, Default)]
struct Inner {
    knowledge: Map<String, Value>,
    log: Vec<KnowledgeDelta>,
    checkpoints: Vec<Checkpoint>,
    next_update_id: u64,
    updates_since_checkpoint: u64,
    archived_before: u64,
}

impl Inner {
    fn from_image(image: Image) -> Self {
        let (mut knowledge, boundary) = match image.checkpoints.last() {
            Some(cp) => (cp.knowledge.clone(), cp.boundary),
            None => (Map::new(), 0),
        };
        let mut replayed = 0;
        for delta in image.log.iter().filter(|d| d.update_id >= boundary) {
            for op in &delta.ops {
                op.apply(&mut knowledge);
            }
            replayed += 1;
        }
        let next_update_id = image
            .log
            .last()
            .map(|d| d.update_id + 1)
            .unwrap_or(0)
            .max(image.next_update_id);

        Self {
            knowledge,
            log: image.log,
            checkpoints: image.checkpoints,
            next_update_id,
            updates_since_checkpoint: replayed,
            archived_before: image.archived_before,
        }
    }

    fn latest_boundary(&self) -> u64 {
        self.checkpoints.last().map(|cp| cp.boundary).unwrap_or(0)
    }

    fn recount_since_checkpoint(&mut self) {
        let boundary = self.latest_boundary();
        self.updates_since_checkpoint =
            self.log.iter().filter(|d| d.update_id >= boundary).count() as u64;
    }

    fn can_rollback_to(&self, update_id: u64) -> bool {
        if update_id < self.archived_before {
            return false;
        }
        update_id == self.next_update_id
            || self.log.iter().any(|d| d.update_id == update_id)
            || self.checkpoints.iter().any(|cp| cp.boundary == update_id)
    }
}

/// 增量知识库；写入、检查点、回滚由同一把锁串行化
pub struct KnowledgeStore {
    checkpoint_frequency: u64,
    sink: Option<Arc<dyn LogSink>>,
    inner: Mutex<Inner>,
}

impl KnowledgeStore {
    /// 纯内存知识库（检查点只保留在内存里）
    pub fn in_memory(checkpoint_frequency: u64) -> Self {
        Self {
            checkpoint_frequency,
            sink: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// 使用指定 sink，并从其已有镜像恢复状态
    pub async fn with_sink(
        checkpoint_frequency: u64,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, RelayError> {
        let inner = match sink.read().await? {
            Some(bytes) => {
                let image: Image = serde_json::from_slice(&bytes)?;
                let inner = Inner::from_image(image);
                tracing::info!(
                    "Loaded knowledge base with {} entries ({} deltas replayed)",
                    inner.knowledge.len(),
                    inner.updates_since_checkpoint
                );
                inner
            }
            None => Inner::default(),
        };

        Ok(Self {
            checkpoint_frequency,
            sink: Some(sink),
            inner: Mutex::new(inner),
        })
    }

    /// 按配置打开：启用持久化时使用 `<storage_path>/knowledge.json`
    pub async fn open(cfg: &KnowledgeSection) -> Result<Self, RelayError> {
        if !cfg.enable_persistence {
            return Ok(Self::in_memory(cfg.checkpoint_frequency));
        }
        let sink = Arc::new(FileLogSink::in_dir(&cfg.storage_path));
        Self::with_sink(cfg.checkpoint_frequency, sink).await
    }

    pub fn is_persistent(&self) -> bool {
        self.sink.is_some()
    }

    /// 追加一条增量并应用，返回其 update id
    pub async fn apply_incremental(&self, ops: Vec<KnowledgeOp>) -> Result<u64, RelayError> {
        let mut inner = self.inner.lock().await;
        let update_id = Self::append(&mut inner, ops);
        tracing::debug!("Applied incremental update {}", update_id);

        if self.checkpoint_frequency > 0
            && inner.updates_since_checkpoint >= self.checkpoint_frequency
        {
            if let Err(e) = self.checkpoint_locked(&mut inner).await {
                tracing::error!("Automatic knowledge checkpoint failed: {}", e);
            }
        }
        Ok(update_id)
    }

    /// 以前缀约定的原始 map 形式写入
    pub async fn apply_map(&self, delta: Map<String, Value>) -> Result<u64, RelayError> {
        self.apply_incremental(KnowledgeOp::decode_map(delta)).await
    }

    /// 批量赋值，作为一条增量记录，随后做一次检查点
    pub async fn merge(&self, other: Map<String, Value>) -> Result<u64, RelayError> {
        let ops = other
            .into_iter()
            .map(|(key, value)| KnowledgeOp::Set { key, value })
            .collect();
        let mut inner = self.inner.lock().await;
        let update_id = Self::append(&mut inner, ops);
        self.checkpoint_locked(&mut inner).await?;
        Ok(update_id)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.knowledge.get(key).cloned()
    }

    pub async fn all(&self) -> Map<String, Value> {
        self.inner.lock().await.knowledge.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.knowledge.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 过滤查询：每个过滤条件要么命中对象字段且值相等，要么是 `"key"` 且等于条目键；其余条件忽略
    pub async fn query(&self, filter: &Map<String, Value>) -> Map<String, Value> {
        let inner = self.inner.lock().await;
        inner
            .knowledge
            .iter()
            .filter(|(key, value)| {
                filter.iter().all(|(field, expected)| {
                    match value.as_object().and_then(|obj| obj.get(field)) {
                        Some(actual) => actual == expected,
                        None if field == "key" => expected.as_str() == Some(key.as_str()),
                        None => true,
                    }
                })
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// 记录检查点并（如有 sink）持久化；返回检查点边界
    pub async fn checkpoint(&self) -> Result<u64, RelayError> {
        let mut inner = self.inner.lock().await;
        self.checkpoint_locked(&mut inner).await
    }

    /// 回滚。None：恢复最近的检查点；Some(id)：恢复到 id 之前的状态。
    /// 回滚截断之后的日志与检查点，但 update id 不回退。
    pub async fn rollback(&self, update_id: Option<u64>) -> Result<bool, RelayError> {
        let mut inner = self.inner.lock().await;
        let restored = match update_id {
            None => self.rollback_to_last_checkpoint(&mut inner).await?,
            Some(id) => Self::rollback_to(&mut inner, id),
        };
        if restored {
            self.persist(&inner).await?;
        }
        Ok(restored)
    }

    pub async fn delta_log(&self, limit: Option<usize>) -> Vec<KnowledgeDelta> {
        let inner = self.inner.lock().await;
        let start = limit
            .map(|l| inner.log.len().saturating_sub(l))
            .unwrap_or(0);
        inner.log[start..].to_vec()
    }

    pub async fn checkpoints(&self) -> Vec<Checkpoint> {
        self.inner.lock().await.checkpoints.clone()
    }

    /// 丢弃最新检查点之前的日志与旧检查点，返回丢弃的日志条数
    pub async fn archive(&self) -> Result<usize, RelayError> {
        let mut inner = self.inner.lock().await;
        if inner.checkpoints.is_empty() {
            return Ok(0);
        }
        let boundary = inner.latest_boundary();
        let before = inner.log.len();
        inner.log.retain(|d| d.update_id >= boundary);
        let keep_from = inner.checkpoints.len() - 1;
        inner.checkpoints.drain(..keep_from);
        inner.archived_before = boundary;
        let dropped = before - inner.log.len();

        self.persist(&inner).await?;
        tracing::info!("Archived {} knowledge deltas before update {}", dropped, boundary);
        Ok(dropped)
    }

    pub async fn statistics(&self) -> KnowledgeStats {
        let inner = self.inner.lock().await;
        KnowledgeStats {
            total_entries: inner.knowledge.len(),
            total_updates: inner.next_update_id,
            delta_log_size: inner.log.len(),
            checkpoint_count: inner.checkpoints.len(),
            last_checkpoint: inner.checkpoints.last().map(|cp| cp.boundary),
            last_update: inner.log.last().map(|d| d.timestamp),
            archived_before: inner.archived_before,
            persistent: self.sink.is_some(),
        }
    }

    fn append(inner: &mut MutexGuard<'_, Inner>, ops: Vec<KnowledgeOp>) -> u64 {
        for op in &ops {
            op.apply(&mut inner.knowledge);
        }
        let update_id = inner.next_update_id;
        inner.log.push(KnowledgeDelta {
            update_id,
            ops,
            timestamp: Utc::now(),
        });
        inner.next_update_id += 1;
        inner.updates_since_checkpoint += 1;
        update_id
    }

    async fn checkpoint_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<u64, RelayError> {
        let boundary = inner.next_update_id;
        let checkpoint = Checkpoint {
            boundary,
            taken_at: Utc::now(),
            knowledge: inner.knowledge.clone(),
        };
        let replaced = inner
            .checkpoints
            .iter()
            .position(|cp| cp.boundary == boundary);
        let replaced = replaced.map(|i| inner.checkpoints.remove(i));
        inner.checkpoints.push(checkpoint);

        // 写入失败时撤回，内存中的检查点与持久化镜像保持一致
        if let Err(e) = self.persist(inner).await {
            inner.checkpoints.pop();
            inner.checkpoints.extend(replaced);
            return Err(e);
        }
        inner.updates_since_checkpoint = 0;
        tracing::info!(
            "Knowledge checkpoint at update {} with {} entries",
            boundary,
            inner.knowledge.len()
        );
        Ok(boundary)
    }

    async fn rollback_to_last_checkpoint(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
    ) -> Result<bool, RelayError> {
        let persisted = match &self.sink {
            Some(sink) => match sink.read().await? {
                Some(bytes) => serde_json::from_slice::<Image>(&bytes)?.checkpoints.pop(),
                None => None,
            },
            None => None,
        };
        let Some(checkpoint) = persisted.or_else(|| inner.checkpoints.last().cloned()) else {
            tracing::warn!("No knowledge checkpoint to roll back to");
            return Ok(false);
        };

        let boundary = checkpoint.boundary;
        inner.knowledge = checkpoint.knowledge.clone();
        inner.log.retain(|d| d.update_id < boundary);
        inner.checkpoints.retain(|cp| cp.boundary < boundary);
        inner.checkpoints.push(checkpoint);
        inner.updates_since_checkpoint = 0;

        tracing::info!("Rolled back knowledge to checkpoint at update {}", boundary);
        Ok(true)
    }

    fn rollback_to(inner: &mut MutexGuard<'_, Inner>, update_id: u64) -> bool {
        if !inner.can_rollback_to(update_id) {
            tracing::warn!("Knowledge update {} not found", update_id);
            return false;
        }

        let (mut knowledge, base) = match inner
            .checkpoints
            .iter()
            .rev()
            .find(|cp| cp.boundary <= update_id)
        {
            Some(cp) => (cp.knowledge.clone(), cp.boundary),
            None => (Map::new(), 0),
        };
        for delta in inner
            .log
            .iter()
            .filter(|d| d.update_id >= base && d.update_id < update_id)
        {
            for op in &delta.ops {
                op.apply(&mut knowledge);
            }
        }

        inner.knowledge = knowledge;
        inner.log.retain(|d| d.update_id < update_id);
        inner.checkpoints.retain(|cp| cp.boundary <= update_id);
        inner.recount_since_checkpoint();

        tracing::info!("Rolled back knowledge to update {}", update_id);
        true
    }

    async fn persist(&self, inner: &Inner) -> Result<(), RelayError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let image = ImageRef {
            checkpoints: &inner.checkpoints,
            log: &inner.log,
            next_update_id: inner.next_update_id,
            archived_before: inner.archived_before,
        };
        let bytes = serde_json::to_vec_pretty(&image)?;
        sink.write(&bytes)
            .await
            .map_err(|e| RelayError::Persistence(e.to_string()))
    }
}
