//! 执行端：主（远程 HTTP）与备（本地监督者）两条执行路径

pub mod http;
pub mod local;
pub mod mock;
pub mod traits;

pub use http::HttpPrimaryExecutor;
pub use local::LocalSupervisor;
pub use mock::{ScriptedPrimary, ScriptedSecondary, Step};
pub use traits::{PrimaryExecutor, SecondaryExecutor, StoryValidation, TaskOutput};
