//! 记忆层：token 估算、上下文窗口、增量知识库与其持久化

pub mod context_window;
pub mod knowledge;
pub mod sink;
pub mod tokens;

pub use context_window::{ContextItem, ContextSnapshot, ContextWindow, Priority, RelevantContext};
pub use knowledge::{Checkpoint, KnowledgeDelta, KnowledgeOp, KnowledgeStats, KnowledgeStore};
pub use sink::{FileLogSink, LogSink, MemoryLogSink};
pub use tokens::{TokenEstimator, CHARS_PER_TOKEN};
