//! Legal exponent ranges and the additive masks that enforce them.

use serde::{Deserialize, Serialize};

use crate::config::ArchConfig;
use crate::tiling::{Dim, DimBudgets, NUM_DIMS};

use super::episode::Episode;

/// Inclusive range `[min, max]` of admissible category indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalRange {
    pub min: u32,
    pub max: u32,
}

impl LegalRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// `[0, max]`.
    pub fn upto(max: u32) -> Self {
        Self::new(0, max)
    }

    /// A single forced value.
    pub fn point(value: u32) -> Self {
        Self::new(value, value)
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, value: u32) -> bool {
        self.min <= value && value <= self.max
    }
}

impl std::fmt::Display for LegalRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Largest `e` with `base^e <= value`, zero for `value < base`.
///
/// Computed by repeated multiplication so exact prime powers never land
/// one below their exponent through log rounding. Infinite input
/// saturates to `u32::MAX`.
pub fn floor_log(value: f64, base: u32) -> u32 {
    let base = base as f64;
    if value.is_infinite() && value > 0.0 {
        return u32::MAX;
    }
    if !(value >= base) {
        return 0;
    }
    let mut exp = 0u32;
    let mut acc = base;
    while acc <= value {
        exp += 1;
        acc *= base;
    }
    exp
}

/// Exponent bound implied by a capacity: `floor(log_base(max(capacity, 1)))`
/// clamped to the category range.
pub fn exponent_cap(capacity: f64, base: u32, categories: usize) -> u32 {
    let top = categories.saturating_sub(1) as u32;
    floor_log(capacity.max(1.0), base).min(top)
}

/// Prime-2 budget of dimensions still unplaced at this level, excluding
/// the active one.
///
/// Signed: if the active dimension was already placed the estimate can
/// go negative, which raises the spatial lower bound.
pub fn leftover_budget(budgets: &DimBudgets, ordered: &[bool; NUM_DIMS], active: Dim) -> i64 {
    let open: i64 = Dim::ALL
        .iter()
        .filter(|d| !ordered[d.index()])
        .map(|&d| budgets.get(d, 0) as i64)
        .sum();
    open - budgets.get(active, 0) as i64
}

/// Lower bound on the spatial exponent so that the remaining spatial map
/// can still be filled by dimensions not yet placed at this level.
pub fn spatial_min(spmap: f64, leftover: i64, spatial_max: u32) -> u32 {
    let needed = floor_log(spmap.max(1.0), 2) as i64 - leftover;
    (needed.max(0) as u64).min(spatial_max as u64) as u32
}

/// Upper bound on how far the temporal (prime-2) exponent may exceed
/// the spatial one at `level`.
///
/// The prime-2 budget of all dimensions must still cover this level's
/// remaining spatial map and the full spatial map of every other level
/// that is not finished yet.
pub fn max_temporal_size(
    arch: &ArchConfig,
    episode: &Episode,
    level: usize,
    budget_sum: u32,
    spmap: f64,
) -> u32 {
    let mut slack = budget_sum as f64 - spmap.max(1.0).log2();
    for (l, config) in arch.levels.iter().enumerate() {
        if l != level && !episode.is_finished(l) {
            slack -= config.spmap_capacity.log2();
        }
    }
    slack.max(0.0).min(u32::MAX as f64) as u32
}

/// Additive mask over `categories`: `-inf` outside `range`, the static
/// structural mask inside it.
pub fn range_mask(categories: usize, range: LegalRange, static_mask: &[f32]) -> Vec<f32> {
    (0..categories)
        .map(|c| {
            if range.contains(c as u32) {
                static_mask.get(c).copied().unwrap_or(0.0)
            } else {
                f32::NEG_INFINITY
            }
        })
        .collect()
}
