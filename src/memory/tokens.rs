//! Token 估算（字符计数近似）
//!
//! 上下文窗口、故事拆分、预检共用同一个比例：约 4 字符 / token。

use serde::Serialize;
use serde_json::Value;

/// 每个 token 大约对应的字符数
pub const CHARS_PER_TOKEN: usize = 4;

/// Token 估算器
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }

    /// 字符串按原文估算，其它 JSON 值按紧凑序列化后的长度估算
    pub fn estimate_value(value: &Value) -> usize {
        match value {
            Value::String(s) => Self::estimate(s),
            other => Self::estimate(&other.to_string()),
        }
    }

    /// 任意可序列化结构（故事、片段）的 token 估算；序列化失败按 0 计
    pub fn estimate_json<T: Serialize + ?Sized>(value: &T) -> usize {
        serde_json::to_string(value)
            .map(|s| Self::estimate(&s))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_proportional_to_length() {
        assert_eq!(TokenEstimator::estimate(""), 0);
        assert_eq!(TokenEstimator::estimate(&"x".repeat(400)), 100);
        assert_eq!(TokenEstimator::estimate("abc"), 0);
    }

    #[test]
    fn test_non_string_values_use_serialized_form() {
        let value = serde_json::json!({"k": "v"});
        assert_eq!(
            TokenEstimator::estimate_value(&value),
            value.to_string().len() / 4
        );
        assert_eq!(
            TokenEstimator::estimate_value(&Value::String("x".repeat(8))),
            2
        );
    }
}
