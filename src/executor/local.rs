//! 本地监督者：默认的备用执行端
//!
//! 预检只做结构与体量判断；执行直接在本地完成，不依赖任何网络。

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{CoordinatorSection, FragmenterSection};
use crate::core::RelayError;
use crate::executor::{SecondaryExecutor, StoryValidation, TaskOutput};
use crate::memory::CHARS_PER_TOKEN;
use crate::story::{Fragment, Story};

#[derive(Debug, Clone)]
pub struct LocalSupervisor {
    /// 超过该字符数（按 token 折算）即要求拆分
    max_task_size: usize,
    max_tasks_per_fragment: usize,
}

impl LocalSupervisor {
    pub fn new(max_task_size: usize, max_tasks_per_fragment: usize) -> Self {
        Self {
            max_task_size,
            max_tasks_per_fragment,
        }
    }

    pub fn from_config(coordinator: &CoordinatorSection, fragmenter: &FragmenterSection) -> Self {
        Self::new(coordinator.max_task_size, fragmenter.max_tasks_per_fragment)
    }

    fn token_limit(&self) -> usize {
        self.max_task_size / CHARS_PER_TOKEN
    }
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::from_config(&CoordinatorSection::default(), &FragmenterSection::default())
    }
}

#[async_trait]
impl SecondaryExecutor for LocalSupervisor {
    async fn validate_story(&self, story: &Story) -> Result<StoryValidation, RelayError> {
        let estimated_tokens = story.estimated_tokens();
        if story.id.trim().is_empty() {
            return Ok(StoryValidation {
                valid: false,
                requires_decomposition: false,
                estimated_tokens,
                notes: Some("story has no id".to_string()),
            });
        }

        let requires_decomposition = estimated_tokens > self.token_limit()
            || story.tasks.len() > self.max_tasks_per_fragment;
        Ok(StoryValidation {
            valid: true,
            requires_decomposition,
            estimated_tokens,
            notes: Some("story appears valid".to_string()),
        })
    }

    async fn execute_task(&self, fragment: &Fragment) -> Result<TaskOutput, RelayError> {
        let started = Instant::now();
        tracing::info!("Local supervisor executing {}", fragment.id);
        Ok(json!({
            "status": "success",
            "result": format!("supervisor executed task: {}", fragment.name),
            "execution_time": started.elapsed().as_secs_f64(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::Task;

    #[tokio::test]
    async fn test_validation_flags_decomposition() {
        let supervisor = LocalSupervisor::new(5000, 3);

        let small = Story::new("s1", "Small").with_task(Task::new("a"));
        let v = supervisor.validate_story(&small).await.unwrap();
        assert!(v.valid);
        assert!(!v.requires_decomposition);

        let many = Story::new("s2", "Many").with_tasks((0..4).map(|i| Task::new(format!("t{i}"))));
        assert!(supervisor.validate_story(&many).await.unwrap().requires_decomposition);

        let big = Story::new("s3", "Big").with_task(Task::new("x".repeat(6000)));
        assert!(supervisor.validate_story(&big).await.unwrap().requires_decomposition);
    }

    #[tokio::test]
    async fn test_missing_id_is_invalid() {
        let v = LocalSupervisor::default()
            .validate_story(&Story::new("  ", "Anonymous"))
            .await
            .unwrap();
        assert!(!v.valid);
    }

    #[tokio::test]
    async fn test_execute_reports_fragment_name() {
        let fragment = Fragment::whole(&Story::new("s1", "Checkout"));
        let out = LocalSupervisor::default().execute_task(&fragment).await.unwrap();
        assert_eq!(out["status"], "success");
        assert_eq!(out["result"], "supervisor executed task: Checkout");
    }
}
