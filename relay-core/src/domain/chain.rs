//! Stage chain reconstruction
//!
//! Storage keeps the chain as `prev_stage_run_id` back-references and returns
//! stages in no particular order. [`StageChain`] rebuilds the ordered sequence
//! once, after loading, so chain navigation works on indices instead of
//! repeated scans.

use super::stage::PipelineRunStage;

/// Anything that sits in a stage chain
pub trait ChainLink {
    fn link_id(&self) -> i64;
    fn prev_link_id(&self) -> i64;
}

impl ChainLink for PipelineRunStage {
    fn link_id(&self) -> i64 {
        self.id
    }

    fn prev_link_id(&self) -> i64 {
        self.prev_stage_run_id
    }
}

/// Stages of one run in chain order
#[derive(Debug, Clone)]
pub struct StageChain<T> {
    ordered: Vec<T>,
    orphaned: Vec<T>,
}

impl<T: ChainLink> StageChain<T> {
    /// Rebuild the chain from an unordered set.
    ///
    /// Starting from back-reference 0, repeatedly picks the stage whose
    /// `prev` is the id found last, until no stage matches. Quadratic in the
    /// number of stages, which stays small. Stages not reachable from the
    /// head (broken links, cycles, a second head) end up in `orphaned`.
    pub fn from_unordered(stages: Vec<T>) -> Self {
        let mut remaining = stages;
        let mut ordered = Vec::with_capacity(remaining.len());
        let mut prev = 0;

        while let Some(pos) = remaining.iter().position(|s| s.prev_link_id() == prev) {
            let stage = remaining.swap_remove(pos);
            prev = stage.link_id();
            ordered.push(stage);
        }

        Self {
            ordered,
            orphaned: remaining,
        }
    }

    pub fn stages(&self) -> &[T] {
        &self.ordered
    }

    pub fn into_stages(self) -> Vec<T> {
        self.ordered
    }

    pub fn orphaned(&self) -> &[T] {
        &self.orphaned
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn position(&self, stage_id: i64) -> Option<usize> {
        self.ordered.iter().position(|s| s.link_id() == stage_id)
    }

    pub fn first(&self) -> Option<&T> {
        self.ordered.first()
    }

    /// Stage after `stage_id`; `None` for the terminal stage or an unknown id.
    pub fn next(&self, stage_id: i64) -> Option<&T> {
        self.position(stage_id)
            .and_then(|idx| self.ordered.get(idx + 1))
    }
}
