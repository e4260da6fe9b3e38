//! Per-episode state snapshots: the step cursor and the finished-level set.
//!
//! Both are plain values. A step consumes one snapshot and returns the
//! next, so one actor can serve any number of episodes side by side.

use serde::{Deserialize, Serialize};

/// Position in the decision sequence: memory level and sub-step within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub level: usize,
    pub sub_step: usize,
}

impl Cursor {
    pub fn new(level: usize, sub_step: usize) -> Self {
        Self { level, sub_step }
    }

    /// First sub-step of the innermost level.
    pub fn start() -> Self {
        Self::new(0, 0)
    }

    /// Flat step index across all levels.
    pub fn mode(self, steps_per_level: usize) -> usize {
        self.level * steps_per_level + self.sub_step
    }

    /// The next cursor, or `None` once the last sub-step of the last
    /// level has been taken.
    pub fn advance(self, steps_per_level: usize, num_levels: usize) -> Option<Cursor> {
        if self.sub_step + 1 < steps_per_level {
            Some(Self::new(self.level, self.sub_step + 1))
        } else if self.level + 1 < num_levels {
            Some(Self::new(self.level + 1, 0))
        } else {
            None
        }
    }
}

/// Which memory levels have had their decisions fully sampled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    finished: Vec<bool>,
}

impl Episode {
    /// Fresh episode with no finished levels.
    pub fn new(num_levels: usize) -> Self {
        Self {
            finished: vec![false; num_levels],
        }
    }

    /// Fresh episode over the same hierarchy.
    pub fn reset(&self) -> Self {
        Self::new(self.finished.len())
    }

    pub fn num_levels(&self) -> usize {
        self.finished.len()
    }

    pub fn is_finished(&self, level: usize) -> bool {
        self.finished.get(level).copied().unwrap_or(false)
    }

    /// Snapshot with `level` marked finished.
    pub fn with_finished(&self, level: usize) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next.finished.get_mut(level) {
            *slot = true;
        }
        next
    }

    pub fn finished_levels(&self) -> impl Iterator<Item = usize> + '_ {
        self.finished
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(level, _)| level)
    }
}
