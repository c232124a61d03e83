//! 执行端抽象：远程主执行端与本地备用监督者

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RelayError;
use crate::story::{Fragment, Story};

/// 执行端返回的原始结果；`result` 字段参与最终合并
pub type TaskOutput = Value;

/// 主执行端：通过连接监管访问的远程服务
#[async_trait]
pub trait PrimaryExecutor: Send + Sync {
    /// 存活探测
    async fn health(&self, endpoint: &str) -> Result<(), RelayError>;

    async fn execute(&self, endpoint: &str, fragment: &Fragment) -> Result<TaskOutput, RelayError>;

    /// 释放底层资源；默认无事可做
    async fn close(&self) {}
}

/// 预检结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryValidation {
    pub valid: bool,
    pub requires_decomposition: bool,
    pub estimated_tokens: usize,
    #[serde(default)]
    pub notes: Option<String>,
}

/// 备用执行端：负责预检，也作为降级时的直接执行路径
#[async_trait]
pub trait SecondaryExecutor: Send + Sync {
    async fn validate_story(&self, story: &Story) -> Result<StoryValidation, RelayError>;

    async fn execute_task(&self, fragment: &Fragment) -> Result<TaskOutput, RelayError>;
}
