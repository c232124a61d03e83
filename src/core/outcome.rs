//! 故事执行结果：逐片段报告、失败点与合并输出

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::RelayError;
use crate::executor::TaskOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorRole {
    Primary,
    Secondary,
}

/// 一个成功完成的片段
#[derive(Debug, Clone, Serialize)]
pub struct FragmentReport {
    pub fragment_id: String,
    pub ordinal: usize,
    pub executed_by: ExecutorRole,
    /// 主执行端失败的原因（降级执行时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// 已在 `StoryOutcome::results` 中按顺序输出
    #[serde(skip_serializing)]
    pub result: TaskOutput,
}

/// 主、备执行端都失败的片段；其后的片段全部被阻塞
#[derive(Debug, Clone, Serialize)]
pub struct FragmentFailure {
    pub fragment_id: String,
    pub ordinal: usize,
    pub primary_error: String,
    /// 未启用降级时为空
    pub secondary_error: Option<String>,
    pub blocked: Vec<String>,
}

impl FragmentFailure {
    pub fn reason(&self) -> String {
        match &self.secondary_error {
            Some(secondary) => format!("primary: {}; secondary: {}", self.primary_error, secondary),
            None => format!("primary: {}; fallback disabled", self.primary_error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoryOutcome {
    pub story_id: String,
    pub run_id: String,
    pub status: StoryStatus,
    pub results: Vec<TaskOutput>,
    pub total_subtasks: usize,
    pub merged_at: DateTime<Utc>,
    pub combined_result: Map<String, Value>,
    pub completed: Vec<FragmentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FragmentFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoryOutcome {
    /// 合并已完成片段的结果。对象型 `result` 按键合并，字符串记为 `key → true`，其它值字符串化后记为 true
    pub fn merge(
        story_id: impl Into<String>,
        run_id: impl Into<String>,
        completed: Vec<FragmentReport>,
        failure: Option<FragmentFailure>,
    ) -> Self {
        let results: Vec<TaskOutput> = completed.iter().map(|r| r.result.clone()).collect();

        let mut combined_result = Map::new();
        for payload in results.iter().filter_map(|r| r.get("result")) {
            match payload {
                Value::Object(fields) => {
                    for (k, v) in fields {
                        combined_result.insert(k.clone(), v.clone());
                    }
                }
                Value::String(s) => {
                    combined_result.insert(s.clone(), Value::Bool(true));
                }
                other => {
                    combined_result.insert(other.to_string(), Value::Bool(true));
                }
            }
        }

        let (status, error) = match &failure {
            Some(f) => (
                StoryStatus::PartialFailure,
                Some(format!("Fragment {} failed: {}", f.fragment_id, f.reason())),
            ),
            None => (StoryStatus::Success, None),
        };

        Self {
            story_id: story_id.into(),
            run_id: run_id.into(),
            status,
            total_subtasks: results.len(),
            results,
            merged_at: Utc::now(),
            combined_result,
            completed,
            failure,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StoryStatus::Success
    }

    /// 失败点对应的错误
    pub fn failure_error(&self) -> Option<RelayError> {
        self.failure.as_ref().map(|f| RelayError::FragmentFailed {
            fragment_id: f.fragment_id.clone(),
            reason: f.reason(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(id: &str, ordinal: usize, result: Value) -> FragmentReport {
        FragmentReport {
            fragment_id: id.to_string(),
            ordinal,
            executed_by: ExecutorRole::Primary,
            fallback_reason: None,
            result,
        }
    }

    #[test]
    fn test_merge_combines_result_payloads() {
        let completed = vec![
            report("f1", 1, json!({"status": "success", "result": {"a": 1}})),
            report("f2", 2, json!({"status": "success", "result": "wrote docs"})),
            report("f3", 3, json!({"status": "success", "result": 42})),
            report("f4", 4, json!({"status": "success"})),
        ];
        let outcome = StoryOutcome::merge("s1", "run", completed, None);

        assert!(outcome.is_success());
        assert_eq!(outcome.total_subtasks, 4);
        assert_eq!(
            Value::Object(outcome.combined_result.clone()),
            json!({"a": 1, "wrote docs": true, "42": true})
        );
        assert!(outcome.failure_error().is_none());

        let serialized = serde_json::to_value(&outcome).unwrap();
        assert_eq!(serialized["status"], "success");
        assert!(serialized["completed"][0].get("result").is_none());
        assert!(serialized.get("failure").is_none());
    }

    #[test]
    fn test_partial_failure_is_explicit() {
        let failure = FragmentFailure {
            fragment_id: "s1_fragment_2".into(),
            ordinal: 2,
            primary_error: "Timed out after 1s".into(),
            secondary_error: Some("Executor error: boom".into()),
            blocked: vec!["s1_fragment_3".into()],
        };
        let outcome = StoryOutcome::merge(
            "s1",
            "run",
            vec![report("s1_fragment_1", 1, json!({"result": {"x": true}}))],
            Some(failure),
        );

        assert_eq!(outcome.status, StoryStatus::PartialFailure);
        assert_eq!(outcome.completed.len(), 1);
        let error = outcome.error.as_deref().unwrap();
        assert!(error.contains("s1_fragment_2") && error.contains("boom"));
        assert!(matches!(
            outcome.failure_error(),
            Some(RelayError::FragmentFailed { ref fragment_id, .. }) if fragment_id == "s1_fragment_2"
        ));
    }
}
