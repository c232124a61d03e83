//! 故事与片段的数据模型
//!
//! Story 一旦提交执行即不可变；拆分时生成新的 Fragment（任务子序列为克隆，不与原故事共享）。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::TokenEstimator;

/// 故事中的单个任务；除 name / description 外的字段原样保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// 提交执行的故事：有序任务 + 产出 + 验收标准
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub acceptance_criteria: Map<String, Value>,
}

impl Story {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            outputs: Map::new(),
            acceptance_criteria: Map::new(),
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: Value) -> Self {
        self.acceptance_criteria.insert(key.into(), value);
        self
    }

    pub fn estimated_tokens(&self) -> usize {
        TokenEstimator::estimate_json(self)
    }
}

/// 片段间依赖类型；当前拆分总是线性的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDependency {
    pub fragment_id: String,
    #[serde(rename = "type")]
    pub kind: DependencyKind,
}

impl FragmentDependency {
    pub fn sequential(fragment_id: impl Into<String>) -> Self {
        Self {
            fragment_id: fragment_id.into(),
            kind: DependencyKind::Sequential,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    pub estimated_tokens: usize,
    /// 拆分完成后回填，同一故事的所有片段一致
    pub total_fragment_count: usize,
}

/// 执行单元：拆分出的片段，或未拆分故事的整体包装
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// `<story_id>_fragment_<n>`；整体包装时等于故事 id
    pub id: String,
    pub story_id: String,
    /// 从 1 开始
    pub ordinal: usize,
    pub name: String,
    pub tasks: Vec<Task>,
    pub outputs: Map<String, Value>,
    pub acceptance_criteria: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<FragmentDependency>,
    pub metadata: FragmentMetadata,
}

impl Fragment {
    /// 将未拆分的故事作为单个执行单元
    pub fn whole(story: &Story) -> Self {
        let mut unit = Self {
            id: story.id.clone(),
            story_id: story.id.clone(),
            ordinal: 1,
            name: story.name.clone(),
            tasks: story.tasks.clone(),
            outputs: story.outputs.clone(),
            acceptance_criteria: story.acceptance_criteria.clone(),
            dependencies: Vec::new(),
            metadata: FragmentMetadata {
                estimated_tokens: 0,
                total_fragment_count: 1,
            },
        };
        unit.metadata.estimated_tokens = TokenEstimator::estimate_json(&unit);
        unit
    }

    pub fn depends_on(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.fragment_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_story_deserializes_with_defaults() {
        let story: Story = serde_json::from_value(json!({
            "id": "s1",
            "name": "Checkout",
            "tasks": [{"name": "design", "owner": "ana"}]
        }))
        .unwrap();

        assert_eq!(story.tasks.len(), 1);
        assert_eq!(story.tasks[0].extra["owner"], json!("ana"));
        assert!(story.outputs.is_empty());
        assert!(story.acceptance_criteria.is_empty());
    }

    #[test]
    fn test_whole_fragment_mirrors_story() {
        let story = Story::new("s1", "Checkout")
            .with_task(Task::new("a"))
            .with_criterion("tests", json!("green"));
        let unit = Fragment::whole(&story);

        assert_eq!(unit.id, "s1");
        assert_eq!(unit.ordinal, 1);
        assert_eq!(unit.metadata.total_fragment_count, 1);
        assert_eq!(unit.tasks, story.tasks);
        assert_eq!(unit.depends_on().count(), 0);
        assert!(unit.metadata.estimated_tokens > 0);
    }

    #[test]
    fn test_dependency_serializes_with_type_tag() {
        let dep = FragmentDependency::sequential("s1_fragment_1");
        assert_eq!(
            serde_json::to_value(&dep).unwrap(),
            json!({"fragment_id": "s1_fragment_1", "type": "sequential"})
        );
    }
}
