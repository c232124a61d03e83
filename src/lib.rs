//! Relay - 具备故障转移的双执行端故事执行核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、熔断器、连接监管、协调器
//! - **executor**: 主执行端（HTTP）与备用执行端（本地监督者）抽象及实现
//! - **memory**: token 估算、上下文窗口、增量知识库与持久化
//! - **observability**: 日志初始化、执行端健康度
//! - **story**: 故事模型与拆分器

pub mod config;
pub mod core;
pub mod executor;
pub mod memory;
pub mod observability;
pub mod story;

pub use crate::core::{create_coordinator, DualAgentCoordinator, RelayError, StoryOutcome};
pub use story::{Fragment, Story, Task};
