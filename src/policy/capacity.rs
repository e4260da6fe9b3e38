//! Buffer capacity model and cross-level budget propagation.
//!
//! A level's buffer holds the cumulative tiles of every resident operand.
//! Growing the active dimension by a factor `f` scales only the operand
//! volumes that contain it, so usage is `f * coefficient + constant` and
//! the admissible headroom is `(buffer_size - constant) / coefficient`.

use crate::config::{ArchConfig, Operand, Residency};
use crate::tiling::{Dim, TilingProgram, NUM_DIMS};

use super::episode::Episode;

/// Linear decomposition of buffer usage with respect to one dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapacityTerms {
    /// Usage that scales with the active dimension.
    pub coefficient: f64,
    /// Usage contributed by resident operands that do not contain it.
    pub constant: f64,
}

impl CapacityTerms {
    /// Split resident operand volumes at `sizes` into terms for `dim`.
    pub fn for_dim(residency: &Residency, sizes: [f64; NUM_DIMS], dim: Dim) -> Self {
        let mut terms = CapacityTerms {
            coefficient: 0.0,
            constant: 0.0,
        };
        for op in Operand::ALL {
            if !residency.holds(op) {
                continue;
            }
            let volume = operand_volume(op, sizes);
            if op.contains(dim) {
                terms.coefficient += volume;
            } else {
                terms.constant += volume;
            }
        }
        terms
    }

    /// Multiplicative headroom left in a buffer of `buffer_size`.
    ///
    /// A dimension absent from every resident operand cannot fill the
    /// buffer, so its headroom is unbounded.
    pub fn headroom(&self, buffer_size: f64) -> f64 {
        if self.coefficient <= 0.0 {
            return f64::INFINITY;
        }
        (buffer_size - self.constant) / self.coefficient
    }
}

/// Tile volume of `op` for dimension sizes `[H, M, K, N]`.
pub fn operand_volume(op: Operand, sizes: [f64; NUM_DIMS]) -> f64 {
    Dim::ALL
        .iter()
        .filter(|&&d| op.contains(d))
        .map(|&d| sizes[d.index()])
        .product()
}

/// Remaining headroom for `dim` in the buffer of `level`, given every
/// decision recorded so far at levels `0..=level`.
pub fn remain_buffer_size(
    arch: &ArchConfig,
    level: usize,
    program: &TilingProgram,
    dim: Dim,
) -> f64 {
    let config = &arch.levels[level];
    let sizes = program.cumulative_sizes(level, &arch.primes);
    CapacityTerms::for_dim(&config.residency, sizes, dim).headroom(config.buffer_size)
}

/// Tightest of several capacities. Empty input is unconstrained.
pub fn min_capacity<I: IntoIterator<Item = f64>>(capacities: I) -> f64 {
    capacities.into_iter().fold(f64::INFINITY, f64::min)
}

/// Headroom for `dim` that stays legal at `level` and at every later
/// level not yet finished.
pub fn propagated_buffer_size(
    arch: &ArchConfig,
    episode: &Episode,
    level: usize,
    program: &TilingProgram,
    dim: Dim,
) -> f64 {
    min_capacity(
        (level..arch.num_levels())
            .filter(|&l| l == level || !episode.is_finished(l))
            .map(|l| remain_buffer_size(arch, l, program, dim)),
    )
}

/// Spatial-map lanes still free at `level` after the parallel factors
/// already chosen there.
pub fn remaining_spmap(arch: &ArchConfig, level: usize, program: &TilingProgram) -> f64 {
    let used: f64 = program.level(level).iter().map(|t| t.spatial_lanes()).product();
    arch.levels[level].spmap_capacity / used
}
