//! 上下文窗口：带优先级与 token 预算的上下文累加器
//!
//! - Critical 项单独存放（按内容去重），永不被剪枝
//! - Normal 项放在按插入顺序的有界队列中，超出条目上限或 token 预算时从最旧开始淘汰
//! - 只剩 Critical 项仍超预算时停止淘汰，并标记为超预算（`is_over_budget`）

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

use crate::config::ContextSection;
use crate::memory::TokenEstimator;

/// 快照中最多返回的最近窗口条目数
const SNAPSHOT_RECENT_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub content: Value,
    pub tokens: usize,
    pub priority: Priority,
    /// 全局插入序号（Normal 与 Critical 共用）
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub total_tokens: usize,
    pub window_items: usize,
    pub priority_items: usize,
    pub over_budget: bool,
    pub priority: Vec<ContextItem>,
    /// 最近的窗口条目，按插入顺序
    pub recent: Vec<ContextItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelevantContext {
    pub priority: Vec<ContextItem>,
    /// 最新的在前
    pub window: Vec<ContextItem>,
    pub total_tokens: usize,
}

#[derive(Debug)]
pub struct ContextWindow {
    max_tokens: usize,
    max_items: usize,
    window: VecDeque<ContextItem>,
    priority: Vec<ContextItem>,
    window_tokens: usize,
    priority_tokens: usize,
    next_seq: u64,
    over_budget: bool,
}

impl ContextWindow {
    pub fn new(max_tokens: usize, max_items: usize) -> Self {
        Self {
            max_tokens,
            max_items: max_items.max(1),
            window: VecDeque::new(),
            priority: Vec::new(),
            window_tokens: 0,
            priority_tokens: 0,
            next_seq: 0,
            over_budget: false,
        }
    }

    pub fn from_config(cfg: &ContextSection) -> Self {
        Self::new(cfg.max_tokens, cfg.max_context_items)
    }

    pub fn add(&mut self, content: Value, priority: Priority) {
        let tokens = TokenEstimator::estimate_value(&content);
        let seq = self.next_seq;
        self.next_seq += 1;

        match priority {
            Priority::Critical => {
                if self.priority.iter().any(|item| item.content == content) {
                    tracing::debug!("Critical context already present, skipping duplicate");
                    return;
                }
                self.priority_tokens += tokens;
                self.priority.push(ContextItem {
                    content,
                    tokens,
                    priority,
                    seq,
                });
            }
            Priority::Normal => {
                if self.window.len() >= self.max_items {
                    self.evict_oldest();
                }
                self.window_tokens += tokens;
                self.window.push_back(ContextItem {
                    content,
                    tokens,
                    priority,
                    seq,
                });
            }
        }

        self.enforce_budget();
    }

    pub fn total_tokens(&self) -> usize {
        self.priority_tokens + self.window_tokens
    }

    /// 仅剩 Critical 项时仍超出 max_tokens
    pub fn is_over_budget(&self) -> bool {
        self.over_budget
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let skip = self.window.len().saturating_sub(SNAPSHOT_RECENT_ITEMS);
        ContextSnapshot {
            total_tokens: self.total_tokens(),
            window_items: self.window.len(),
            priority_items: self.priority.len(),
            over_budget: self.over_budget,
            priority: self.priority.clone(),
            recent: self.window.iter().skip(skip).cloned().collect(),
        }
    }

    /// Critical 项总是包含；窗口条目从最新开始填充剩余预算，遇到第一个放不下的即停止。
    /// `max_tokens` 为 None 时使用窗口自身的预算。
    pub fn relevant(&self, max_tokens: Option<usize>) -> RelevantContext {
        let budget = max_tokens.unwrap_or(self.max_tokens);
        let mut used = self.priority_tokens;
        let mut window = Vec::new();

        for item in self.window.iter().rev() {
            if used + item.tokens > budget {
                break;
            }
            used += item.tokens;
            window.push(item.clone());
        }

        RelevantContext {
            priority: self.priority.clone(),
            window,
            total_tokens: used,
        }
    }

    /// 丢弃在最近 `max_age` 次插入之前加入的窗口条目，返回丢弃数量
    pub fn prune_older_than(&mut self, max_age: u64) -> usize {
        let cutoff = self.next_seq.saturating_sub(max_age);
        let mut removed = 0;
        while let Some(front) = self.window.front() {
            if front.seq >= cutoff {
                break;
            }
            self.evict_oldest();
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!("Pruned {} aged context items", removed);
            self.over_budget = self.total_tokens() > self.max_tokens;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.priority.clear();
        self.window_tokens = 0;
        self.priority_tokens = 0;
        self.over_budget = false;
    }

    fn evict_oldest(&mut self) -> bool {
        match self.window.pop_front() {
            Some(item) => {
                self.window_tokens -= item.tokens;
                true
            }
            None => false,
        }
    }

    fn enforce_budget(&mut self) {
        while self.total_tokens() > self.max_tokens {
            if !self.evict_oldest() {
                if !self.over_budget {
                    tracing::warn!(
                        "Context over budget with only critical items: {} > {} tokens",
                        self.total_tokens(),
                        self.max_tokens
                    );
                }
                self.over_budget = true;
                return;
            }
        }
        self.over_budget = false;
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::from_config(&ContextSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 恰好 `tokens` 个 token 的文本
    fn text(tokens: usize, tag: usize) -> Value {
        let prefix = format!("{tag:04}");
        Value::String(format!("{}{}", prefix, "x".repeat(tokens * 4 - prefix.len())))
    }

    #[test]
    fn test_budget_keeps_at_most_ten_hundred_token_items() {
        let mut ctx = ContextWindow::new(1000, 1000);
        for i in 0..20 {
            ctx.add(text(100, i), Priority::Normal);
            assert!(ctx.window_len() <= 10);
            assert!(ctx.total_tokens() <= 1000);
        }

        assert_eq!(ctx.window_len(), 10);
        let snapshot = ctx.snapshot();
        let kept: Vec<u64> = snapshot.recent.iter().map(|item| item.seq).collect();
        assert_eq!(kept, (10..20).collect::<Vec<_>>());
        assert!(!ctx.is_over_budget());
    }

    #[test]
    fn test_item_limit_drops_oldest() {
        let mut ctx = ContextWindow::new(100_000, 3);
        for i in 0..5 {
            ctx.add(json!(format!("note {i}")), Priority::Normal);
        }
        let contents: Vec<Value> = ctx.snapshot().recent.into_iter().map(|i| i.content).collect();
        assert_eq!(contents, vec![json!("note 2"), json!("note 3"), json!("note 4")]);
    }

    #[test]
    fn test_critical_items_survive_pressure() {
        let mut ctx = ContextWindow::new(300, 100);
        ctx.add(text(200, 0), Priority::Critical);
        for i in 1..10 {
            ctx.add(text(100, i), Priority::Normal);
        }
        assert_eq!(ctx.priority_len(), 1);
        assert_eq!(ctx.window_len(), 1);
        assert_eq!(ctx.total_tokens(), 300);

        ctx.add(text(500, 99), Priority::Critical);
        assert_eq!(ctx.priority_len(), 2);
        assert_eq!(ctx.window_len(), 0);
        assert!(ctx.is_over_budget());
        assert_eq!(ctx.total_tokens(), 700);
    }

    #[test]
    fn test_critical_duplicates_are_ignored() {
        let mut ctx = ContextWindow::new(1000, 10);
        ctx.add(json!({"criterion": "tests pass"}), Priority::Critical);
        ctx.add(json!({"criterion": "tests pass"}), Priority::Critical);
        assert_eq!(ctx.priority_len(), 1);
    }

    #[test]
    fn test_relevant_prefers_recent_and_stops_at_first_misfit() {
        let mut ctx = ContextWindow::new(10_000, 100);
        ctx.add(text(50, 0), Priority::Critical);
        ctx.add(text(10, 1), Priority::Normal);
        ctx.add(text(100, 2), Priority::Normal);
        ctx.add(text(20, 3), Priority::Normal);

        let relevant = ctx.relevant(Some(100));
        assert_eq!(relevant.priority.len(), 1);
        let seqs: Vec<u64> = relevant.window.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![3]);
        assert_eq!(relevant.total_tokens, 70);

        let everything = ctx.relevant(None);
        assert_eq!(everything.window.len(), 3);
    }

    #[test]
    fn test_prune_older_than_and_clear() {
        let mut ctx = ContextWindow::new(10_000, 100);
        ctx.add(json!("keep me"), Priority::Critical);
        for i in 0..6 {
            ctx.add(json!(format!("item {i}")), Priority::Normal);
        }
        assert_eq!(ctx.prune_older_than(3), 3);
        assert_eq!(ctx.window_len(), 3);
        assert_eq!(ctx.priority_len(), 1);
        assert_eq!(ctx.prune_older_than(3), 0);

        ctx.clear();
        assert_eq!(ctx.total_tokens(), 0);
        assert_eq!(ctx.snapshot().priority_items, 0);
    }
}
