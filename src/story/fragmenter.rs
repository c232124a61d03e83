//! 故事拆分器：把超大的故事切成有序、线性依赖的片段
//!
//! 纯函数，不修改输入。小故事原样返回（`Fragmentation::Whole`），否则按
//! `max_tasks_per_fragment` 连续切块，每块依赖前一块。

use serde::Serialize;

use crate::config::FragmenterSection;
use crate::memory::TokenEstimator;
use crate::story::{Fragment, FragmentDependency, FragmentMetadata, Story};

/// 拆分结果
#[derive(Debug, Clone, PartialEq)]
pub enum Fragmentation {
    /// 故事足够小（或没有可拆的任务），原样返回
    Whole(Story),
    /// 拆分后的片段，按执行顺序排列
    Split(Vec<Fragment>),
}

impl Fragmentation {
    pub fn is_split(&self) -> bool {
        matches!(self, Fragmentation::Split(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Fragmentation::Whole(_) => 1,
            Fragmentation::Split(fragments) => fragments.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 统一为执行单元列表（整体故事包装为单个片段）
    pub fn into_fragments(self) -> Vec<Fragment> {
        match self {
            Fragmentation::Whole(story) => vec![Fragment::whole(&story)],
            Fragmentation::Split(fragments) => fragments,
        }
    }
}

/// 拆分预估（不执行拆分）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentationInfo {
    pub estimated_tokens: usize,
    pub task_count: usize,
    pub would_fragment: bool,
    pub estimated_fragments: usize,
    pub max_story_size: usize,
    pub max_tasks_per_fragment: usize,
}

#[derive(Debug, Clone)]
pub struct StoryFragmenter {
    max_story_size: usize,
    max_tasks_per_fragment: usize,
}

impl StoryFragmenter {
    pub fn new(max_story_size: usize, max_tasks_per_fragment: usize) -> Self {
        Self {
            max_story_size,
            max_tasks_per_fragment: max_tasks_per_fragment.max(1),
        }
    }

    pub fn from_config(cfg: &FragmenterSection) -> Self {
        Self::new(cfg.max_story_size, cfg.max_tasks_per_fragment)
    }

    pub fn fragment(&self, story: &Story) -> Fragmentation {
        let estimated_tokens = story.estimated_tokens();

        if !self.exceeds_limits(estimated_tokens, story.tasks.len()) {
            tracing::debug!(
                "Story {} is small ({} tokens, {} tasks), returning as-is",
                story.id,
                estimated_tokens,
                story.tasks.len()
            );
            return Fragmentation::Whole(story.clone());
        }
        if story.tasks.is_empty() {
            tracing::warn!(
                "Story {} is oversized ({} tokens) but has no tasks to split",
                story.id,
                estimated_tokens
            );
            return Fragmentation::Whole(story.clone());
        }

        tracing::info!("Fragmenting story {} ({} tokens)", story.id, estimated_tokens);

        let mut fragments: Vec<Fragment> = story
            .tasks
            .chunks(self.max_tasks_per_fragment)
            .enumerate()
            .map(|(index, chunk)| {
                let ordinal = index + 1;
                let mut fragment = Fragment {
                    id: format!("{}_fragment_{}", story.id, ordinal),
                    story_id: story.id.clone(),
                    ordinal,
                    name: format!("{} - Fragment {}", story.name, ordinal),
                    tasks: chunk.to_vec(),
                    outputs: story.outputs.clone(),
                    acceptance_criteria: story.acceptance_criteria.clone(),
                    dependencies: Vec::new(),
                    metadata: FragmentMetadata::default(),
                };
                fragment.metadata.estimated_tokens = TokenEstimator::estimate_json(&fragment);
                fragment
            })
            .collect();

        for index in 1..fragments.len() {
            let previous = fragments[index - 1].id.clone();
            fragments[index]
                .dependencies
                .push(FragmentDependency::sequential(previous));
        }

        let total = fragments.len();
        for fragment in &mut fragments {
            fragment.metadata.total_fragment_count = total;
        }

        tracing::info!("Created {} fragments from story {}", total, story.id);
        Fragmentation::Split(fragments)
    }

    /// 是否超过拆分阈值（token 或任务数）
    pub fn can_fragment(&self, story: &Story) -> bool {
        self.exceeds_limits(story.estimated_tokens(), story.tasks.len())
    }

    pub fn fragmentation_info(&self, story: &Story) -> FragmentationInfo {
        let estimated_tokens = story.estimated_tokens();
        let task_count = story.tasks.len();
        let would_fragment = self.exceeds_limits(estimated_tokens, task_count);
        let estimated_fragments = if would_fragment && task_count > 0 {
            task_count.div_ceil(self.max_tasks_per_fragment)
        } else {
            1
        };

        FragmentationInfo {
            estimated_tokens,
            task_count,
            would_fragment,
            estimated_fragments,
            max_story_size: self.max_story_size,
            max_tasks_per_fragment: self.max_tasks_per_fragment,
        }
    }

    fn exceeds_limits(&self, estimated_tokens: usize, task_count: usize) -> bool {
        estimated_tokens > self.max_story_size || task_count > self.max_tasks_per_fragment
    }
}

impl Default for StoryFragmenter {
    fn default() -> Self {
        Self::from_config(&FragmenterSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::Task;
    use serde_json::json;

    fn story_with_tasks(count: usize) -> Story {
        Story::new("story", "Big story")
            .with_tasks((0..count).map(|i| Task::new(format!("task-{i}"))))
            .with_output("report", json!("report.md"))
            .with_criterion("coverage", json!(0.8))
    }

    #[test]
    fn test_ten_tasks_by_three_gives_four_linked_fragments() {
        let fragmenter = StoryFragmenter::new(10_000, 3);
        let story = story_with_tasks(10);

        let Fragmentation::Split(fragments) = fragmenter.fragment(&story) else {
            panic!("expected a split");
        };

        let sizes: Vec<usize> = fragments.iter().map(|f| f.tasks.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(fragments[0].id, "story_fragment_1");
        assert_eq!(fragments[3].id, "story_fragment_4");
        assert_eq!(fragments[3].name, "Big story - Fragment 4");
        assert!(fragments[0].dependencies.is_empty());

        let links: usize = fragments.iter().map(|f| f.dependencies.len()).sum();
        assert_eq!(links, 3);
        for pair in fragments.windows(2) {
            assert_eq!(pair[1].depends_on().collect::<Vec<_>>(), vec![pair[0].id.as_str()]);
        }
        assert!(fragments.iter().all(|f| f.metadata.total_fragment_count == 4));
    }

    #[test]
    fn test_fragment_count_is_ceiling_of_tasks_over_limit() {
        for (tasks, per_fragment) in [(11, 2), (12, 4), (7, 1), (25, 10), (5, 4)] {
            let fragmenter = StoryFragmenter::new(1_000_000, per_fragment);
            let fragmentation = fragmenter.fragment(&story_with_tasks(tasks));
            let expected = tasks.div_ceil(per_fragment);

            assert_eq!(fragmentation.len(), expected, "T={tasks} K={per_fragment}");
            let fragments = fragmentation.into_fragments();
            assert!(fragments
                .iter()
                .all(|f| f.metadata.total_fragment_count == expected));
            let flattened: Vec<&str> = fragments
                .iter()
                .flat_map(|f| f.tasks.iter().map(|t| t.name.as_str()))
                .collect();
            let expected_names: Vec<String> = (0..tasks).map(|i| format!("task-{i}")).collect();
            assert_eq!(flattened, expected_names.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_small_story_is_returned_whole_and_untouched() {
        let fragmenter = StoryFragmenter::new(10_000, 10);
        let story = story_with_tasks(4);
        let before = story.clone();

        match fragmenter.fragment(&story) {
            Fragmentation::Whole(returned) => assert_eq!(returned, story),
            Fragmentation::Split(_) => panic!("small story must not be split"),
        }
        assert_eq!(story, before);
    }

    #[test]
    fn test_fragments_carry_outputs_and_criteria() {
        let fragmenter = StoryFragmenter::new(10_000, 2);
        let story = story_with_tasks(3);
        for fragment in fragmenter.fragment(&story).into_fragments() {
            assert_eq!(fragment.outputs, story.outputs);
            assert_eq!(fragment.acceptance_criteria, story.acceptance_criteria);
            assert_eq!(fragment.story_id, "story");
            assert!(fragment.metadata.estimated_tokens > 0);
        }
    }

    #[test]
    fn test_token_oversized_story_with_few_tasks_yields_single_fragment() {
        let fragmenter = StoryFragmenter::new(5, 10);
        let fragmentation = fragmenter.fragment(&story_with_tasks(2));

        assert!(fragmentation.is_split());
        let fragments = fragmentation.into_fragments();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].id, "story_fragment_1");
        assert_eq!(fragments[0].metadata.total_fragment_count, 1);
    }

    #[test]
    fn test_oversized_story_without_tasks_stays_whole() {
        let fragmenter = StoryFragmenter::new(1, 10);
        let story = Story::new("empty", "Nothing to split").with_output("x", json!("y".repeat(100)));
        assert!(fragmenter.can_fragment(&story));
        assert!(!fragmenter.fragment(&story).is_split());
    }

    #[test]
    fn test_fragmentation_info_is_a_dry_run() {
        let fragmenter = StoryFragmenter::new(10_000, 3);
        let info = fragmenter.fragmentation_info(&story_with_tasks(10));
        assert!(info.would_fragment);
        assert_eq!(info.task_count, 10);
        assert_eq!(info.estimated_fragments, 4);
        assert_eq!(info.max_tasks_per_fragment, 3);

        let small = fragmenter.fragmentation_info(&story_with_tasks(2));
        assert!(!small.would_fragment);
        assert_eq!(small.estimated_fragments, 1);
        assert!(!fragmenter.can_fragment(&story_with_tasks(3)));
    }
}
