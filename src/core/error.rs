//! 执行链路的错误分类
//!
//! 瞬时错误（连接、超时、熔断）由协调器降级到备用执行端吸收；校验错误是致命的，不做任何执行尝试。

use std::time::Duration;

use thiserror::Error;

/// 执行、持久化过程中可能出现的错误
#[derive(Error, Debug)]
pub enum RelayError {
    /// 连接断开或探活失败，触发重连 / 退避
    #[error("Connection error: {0}")]
    Connection(String),

    /// 调用超时，与连接错误同等对待
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// 熔断器打开，未发起远程调用
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// 故事结构或预检不通过，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 主、备执行端均失败；阻塞其后的所有片段
    #[error("Fragment {fragment_id} failed: {reason}")]
    FragmentFailed { fragment_id: String, reason: String },

    /// 执行端返回的业务错误（如 HTTP 5xx）
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// 连接、超时、熔断属于瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Connection(_) | RelayError::Timeout(_) | RelayError::CircuitOpen
        )
    }
}

/// 熔断器拒绝调用时的错误；可转换为任意实现了 `From<CircuitBreakerOpen>` 的错误类型
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Circuit breaker is open")]
pub struct CircuitBreakerOpen;

impl From<CircuitBreakerOpen> for RelayError {
    fn from(_: CircuitBreakerOpen) -> Self {
        RelayError::CircuitOpen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::Connection("reset".into()).is_transient());
        assert!(RelayError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(RelayError::CircuitOpen.is_transient());
        assert!(!RelayError::Validation("missing id".into()).is_transient());
        assert!(!RelayError::Executor("500".into()).is_transient());
    }

    #[test]
    fn test_breaker_open_converts() {
        let err: RelayError = CircuitBreakerOpen.into();
        assert!(matches!(err, RelayError::CircuitOpen));
    }
}
