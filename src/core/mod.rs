//! 核心执行层：错误分类、熔断、连接监管、协调器与其组装

pub mod builder;
pub mod circuit_breaker;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod outcome;

pub use builder::{create_coordinator, CoordinatorBuilder};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use connection::{ConnectionState, ConnectionSupervisor, SupervisorSettings};
pub use coordinator::DualAgentCoordinator;
pub use error::{CircuitBreakerOpen, RelayError};
pub use outcome::{ExecutorRole, FragmentFailure, FragmentReport, StoryOutcome, StoryStatus};
