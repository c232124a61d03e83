//! 故事模型与拆分

pub mod fragmenter;
pub mod types;

pub use fragmenter::{Fragmentation, FragmentationInfo, StoryFragmenter};
pub use types::{DependencyKind, Fragment, FragmentDependency, FragmentMetadata, Story, Task};
