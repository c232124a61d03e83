//! 可编排的执行端替身，用于单元测试与集成测试
//!
//! 每次调用按脚本顺序消费一步；脚本耗尽后按默认行为成功返回。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::RelayError;
use crate::executor::{PrimaryExecutor, SecondaryExecutor, StoryValidation, TaskOutput};
use crate::story::{Fragment, Story};

/// 一次执行调用的脚本
#[derive(Debug, Clone)]
pub enum Step {
    /// 返回给定结果
    Respond(Value),
    /// 传输层失败（连接错误）
    Refuse,
    /// 执行端业务错误
    Fail(String),
    /// 睡眠后按默认结果返回，用于触发超时
    Stall(Duration),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn default_output(fragment: &Fragment, executed_by: &str) -> TaskOutput {
    let mut result = Map::new();
    result.insert(fragment.id.clone(), Value::from(executed_by));
    json!({
        "status": "success",
        "result": result,
    })
}

async fn run_step(step: Option<Step>, fragment: &Fragment, executed_by: &str) -> Result<TaskOutput, RelayError> {
    match step {
        None => Ok(default_output(fragment, executed_by)),
        Some(Step::Respond(value)) => Ok(value),
        Some(Step::Refuse) => Err(RelayError::Connection(format!("{executed_by} refused connection"))),
        Some(Step::Fail(msg)) => Err(RelayError::Executor(msg)),
        Some(Step::Stall(delay)) => {
            tokio::time::sleep(delay).await;
            Ok(default_output(fragment, executed_by))
        }
    }
}

/// 主执行端替身
#[derive(Debug)]
pub struct ScriptedPrimary {
    health_script: Mutex<VecDeque<bool>>,
    healthy: AtomicBool,
    steps: Mutex<VecDeque<Step>>,
    health_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl ScriptedPrimary {
    pub fn new() -> Self {
        Self {
            health_script: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            steps: Mutex::new(VecDeque::new()),
            health_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 始终探活失败
    pub fn unreachable() -> Self {
        let primary = Self::new();
        primary.set_healthy(false);
        primary
    }

    pub fn with_health(self, script: impl IntoIterator<Item = bool>) -> Self {
        lock(&self.health_script).extend(script);
        self
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        lock(&self.steps).extend(steps);
        self
    }

    /// 探活脚本耗尽后的默认结果
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn push_step(&self, step: Step) {
        lock(&self.steps).push_back(step);
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn executed_ids(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedPrimary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryExecutor for ScriptedPrimary {
    async fn health(&self, endpoint: &str) -> Result<(), RelayError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let healthy = lock(&self.health_script)
            .pop_front()
            .unwrap_or_else(|| self.healthy.load(Ordering::SeqCst));
        if healthy {
            Ok(())
        } else {
            Err(RelayError::Connection(format!("{endpoint} is unreachable")))
        }
    }

    async fn execute(&self, _endpoint: &str, fragment: &Fragment) -> Result<TaskOutput, RelayError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.executed).push(fragment.id.clone());
        let step = lock(&self.steps).pop_front();
        run_step(step, fragment, "primary").await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 备用执行端替身
#[derive(Debug, Default)]
pub struct ScriptedSecondary {
    validation: Mutex<Option<StoryValidation>>,
    validation_delay: Mutex<Option<Duration>>,
    decompose: AtomicBool,
    steps: Mutex<VecDeque<Step>>,
    validate_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedSecondary {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预检总是要求拆分
    pub fn decomposing(self) -> Self {
        self.decompose.store(true, Ordering::SeqCst);
        self
    }

    /// 固定的预检结果
    pub fn with_validation(self, validation: StoryValidation) -> Self {
        *lock(&self.validation) = Some(validation);
        self
    }

    /// 预检前先睡眠，用于触发预检超时
    pub fn with_validation_delay(self, delay: Duration) -> Self {
        *lock(&self.validation_delay) = Some(delay);
        self
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        lock(&self.steps).extend(steps);
        self
    }

    pub fn push_step(&self, step: Step) {
        lock(&self.steps).push_back(step);
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn executed_ids(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

#[async_trait]
impl SecondaryExecutor for ScriptedSecondary {
    async fn validate_story(&self, story: &Story) -> Result<StoryValidation, RelayError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.validation_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fixed) = lock(&self.validation).clone() {
            return Ok(fixed);
        }
        Ok(StoryValidation {
            valid: true,
            requires_decomposition: self.decompose.load(Ordering::SeqCst),
            estimated_tokens: story.estimated_tokens(),
            notes: None,
        })
    }

    async fn execute_task(&self, fragment: &Fragment) -> Result<TaskOutput, RelayError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.executed).push(fragment.id.clone());
        let step = lock(&self.steps).pop_front();
        run_step(step, fragment, "secondary").await
    }
}
