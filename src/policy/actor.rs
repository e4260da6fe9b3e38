//! Step orchestrator: derives legal ranges for one sub-step of one memory
//! level and samples every categorical decision of that step for each
//! element of the batch.
//!
//! Per element and step, decisions are taken in dependency order:
//! 1. spatial (parallel) exponent, bounded by the level's spatial map
//! 2. prime-2 exponent, bounded below by the spatial exponent
//! 3. exponents of the remaining primes, each bounded by the capacity left
//!    after the primes sampled before it

use log::{debug, info, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ArchConfig;
use crate::error::{ConfigError, PolicyError};
use crate::tiling::{prime_power, Dim, DimBudgets, DimTile, TilingProgram, NUM_DIMS};

use super::capacity::{propagated_buffer_size, remaining_spmap};
use super::episode::{Cursor, Episode};
use super::range::{
    exponent_cap, leftover_budget, max_temporal_size, range_mask, spatial_min, LegalRange,
};
use super::sampler::{sample_masked, Sample};
use super::scores::StepScores;

/// Dimension processed at each sub-step of a level: H, M, N, K.
pub const LOOP_ORDER: [Dim; NUM_DIMS] = [Dim::H, Dim::M, Dim::N, Dim::K];

/// Loop-order action for `sub_step`. Fixed, never sampled.
pub fn loop_order(sub_step: usize) -> Dim {
    LOOP_ORDER[sub_step % NUM_DIMS]
}

/// Structural legality masks of one element, independent of budgets.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticMasks {
    num_primes: usize,
    categories: usize,
    /// Additive masks, `[dim][prime][category]`.
    tile: Vec<f32>,
    parallel_allowed: [bool; NUM_DIMS],
}

impl StaticMasks {
    /// Everything structurally allowed.
    pub fn open(num_primes: usize, categories: usize) -> Self {
        Self {
            num_primes,
            categories,
            tile: vec![0.0; NUM_DIMS * num_primes * categories],
            parallel_allowed: [true; NUM_DIMS],
        }
    }

    /// Forbid `category` for prime `p` of `dim`.
    pub fn forbid(mut self, dim: Dim, p: usize, category: usize) -> Self {
        let idx = self.offset(dim, p) + category;
        self.tile[idx] = f32::NEG_INFINITY;
        self
    }

    pub fn with_parallel(mut self, dim: Dim, allowed: bool) -> Self {
        self.parallel_allowed[dim.index()] = allowed;
        self
    }

    pub fn tile_row(&self, dim: Dim, p: usize) -> &[f32] {
        let start = self.offset(dim, p);
        &self.tile[start..start + self.categories]
    }

    pub fn parallel_allowed(&self, dim: Dim) -> bool {
        self.parallel_allowed[dim.index()]
    }

    fn offset(&self, dim: Dim, p: usize) -> usize {
        (dim.index() * self.num_primes + p) * self.categories
    }
}

/// Environment-owned state of one batch element at the current step.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementState {
    pub program: TilingProgram,
    pub budgets: DimBudgets,
    pub masks: StaticMasks,
    /// Dimensions already placed at the current level.
    pub ordered: [bool; NUM_DIMS],
}

impl ElementState {
    /// Empty program with open masks and the given budgets.
    pub fn new(arch: &ArchConfig, budgets: DimBudgets) -> Self {
        Self {
            program: TilingProgram::new(arch.num_levels(), arch.num_primes()),
            budgets,
            masks: StaticMasks::open(arch.num_primes(), arch.categories),
            ordered: [false; NUM_DIMS],
        }
    }

    pub fn with_masks(mut self, masks: StaticMasks) -> Self {
        self.masks = masks;
        self
    }

    /// State after `tile` was decided for `dim` at `level`: recorded in
    /// the program, charged to the budget, and marked as placed.
    pub fn apply(&self, level: usize, dim: Dim, tile: DimTile) -> Result<Self, PolicyError> {
        let budgets = self.budgets.consume(dim, &tile.exponents);
        let program = self.program.record(level, dim, tile)?;
        let mut ordered = self.ordered;
        ordered[dim.index()] = true;
        Ok(Self {
            program,
            budgets,
            masks: self.masks.clone(),
            ordered,
        })
    }

    /// Terminal-level placement: `dim` takes whatever budget is left.
    pub fn absorb_remaining(&self, level: usize, dim: Dim) -> Result<Self, PolicyError> {
        let tile = DimTile {
            exponents: self.budgets.row(dim).to_vec(),
            parallel: 0,
            spatial: 0,
        };
        self.apply(level, dim, tile)
    }

    /// State on entering a new level: no dimension placed yet.
    pub fn enter_level(&self) -> Self {
        Self {
            ordered: [false; NUM_DIMS],
            ..self.clone()
        }
    }
}

/// Decisions sampled for one element in one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementStep {
    /// Exponent per prime for the active dimension.
    pub tiles: Vec<u32>,
    /// 1 if any spatial tiling was chosen.
    pub parallel: u32,
    /// Spatial exponent per prime; only prime 2 can be spatial.
    pub spatial_tiles: Vec<u32>,
    /// One per prime, then the spatial decision.
    pub samples: Vec<Sample>,
    /// Legal range of each decision, aligned with `samples`.
    pub ranges: Vec<LegalRange>,
    /// Additive mask each decision was sampled under, aligned with `samples`.
    pub masks: Vec<Vec<f32>>,
}

impl ElementStep {
    pub fn log_probs(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.log_prob).collect()
    }

    pub fn validity(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.weight()).collect()
    }

    /// The decision as a history cell.
    pub fn to_dim_tile(&self) -> DimTile {
        DimTile {
            exponents: self.tiles.clone(),
            parallel: self.parallel,
            spatial: self.spatial_tiles.first().copied().unwrap_or(0),
        }
    }
}

/// Result of one step over the whole batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Loop-order action (dimension placed this step).
    pub order: Dim,
    /// Per-element decisions; `None` on the terminal level.
    pub elements: Option<Vec<ElementStep>>,
    batch: usize,
    num_primes: usize,
}

impl StepOutput {
    fn terminal(order: Dim, batch: usize, num_primes: usize) -> Self {
        Self {
            order,
            elements: None,
            batch,
            num_primes,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.elements.is_none()
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// `[batch][num_primes + 1]` log-probabilities; zeros when terminal.
    pub fn log_probs(&self) -> Vec<Vec<f32>> {
        match &self.elements {
            Some(elements) => elements.iter().map(ElementStep::log_probs).collect(),
            None => vec![vec![0.0; self.num_primes + 1]; self.batch],
        }
    }

    /// `[batch][num_primes + 1]` validity weights; zeros when terminal.
    pub fn validity(&self) -> Vec<Vec<f32>> {
        match &self.elements {
            Some(elements) => elements.iter().map(ElementStep::validity).collect(),
            None => vec![vec![0.0; self.num_primes + 1]; self.batch],
        }
    }
}

/// Constrained autoregressive sampler over a fixed architecture.
///
/// Holds only static configuration; per-episode state travels in
/// `Episode` values.
#[derive(Clone, Debug)]
pub struct TilingActor {
    arch: ArchConfig,
}

impl TilingActor {
    pub fn new(arch: ArchConfig) -> Result<Self, ConfigError> {
        arch.validate()?;
        Ok(Self { arch })
    }

    pub fn arch(&self) -> &ArchConfig {
        &self.arch
    }

    /// A fresh episode over this architecture.
    pub fn episode(&self) -> Episode {
        Episode::new(self.arch.num_levels())
    }

    /// Sample the decisions of one step for the whole batch.
    ///
    /// Returns the output and the episode to pass into the next step.
    /// On the last level only the loop-order action is produced.
    pub fn step<R: Rng + ?Sized>(
        &self,
        episode: &Episode,
        cursor: Cursor,
        batch: &[ElementState],
        scores: &StepScores,
        rng: &mut R,
    ) -> Result<(StepOutput, Episode), PolicyError> {
        self.check_inputs(cursor, batch, scores)?;

        let order = loop_order(cursor.sub_step);
        let num_primes = self.arch.num_primes();
        if cursor.level == self.arch.terminal_level() {
            debug!("terminal level {}: order {} only", cursor.level, order);
            return Ok((
                StepOutput::terminal(order, batch.len(), num_primes),
                episode.clone(),
            ));
        }

        let finalizing = cursor.sub_step == self.arch.steps_per_level - 1;
        let next_episode = if finalizing {
            episode.with_finished(cursor.level)
        } else {
            episode.clone()
        };

        let mut elements = Vec::with_capacity(batch.len());
        for (b, state) in batch.iter().enumerate() {
            elements.push(self.sample_element(
                &next_episode,
                cursor,
                order,
                finalizing,
                state,
                scores,
                b,
                rng,
            ));
        }

        if finalizing {
            info!(
                "level {} ({}) finished",
                cursor.level, self.arch.levels[cursor.level].name
            );
        }

        Ok((
            StepOutput {
                order,
                elements: Some(elements),
                batch: batch.len(),
                num_primes,
            },
            next_episode,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_element<R: Rng + ?Sized>(
        &self,
        episode: &Episode,
        cursor: Cursor,
        order: Dim,
        finalizing: bool,
        state: &ElementState,
        scores: &StepScores,
        b: usize,
        rng: &mut R,
    ) -> ElementStep {
        let arch = &self.arch;
        let categories = arch.categories;
        let level = cursor.level;
        let program = &state.program;

        // Prime 2 upper bound from buffer capacity and budget.
        let mut capacity = propagated_buffer_size(arch, episode, level, program, order);
        let primary_cap = exponent_cap(capacity, 2, categories).min(state.budgets.get(order, 0));

        // Spatial bounds from the level's spatial map.
        let spmap = remaining_spmap(arch, level, program);
        let spatial_max = if state.masks.parallel_allowed(order) {
            exponent_cap(spmap, 2, categories)
        } else {
            0
        }
        .min(primary_cap);

        let prime2_mask = state.masks.tile_row(order, 0);
        let (spatial, spatial_range, spatial_mask) = if finalizing {
            let range = LegalRange::point(spatial_max);
            (
                Sample::forced(spatial_max),
                range,
                range_mask(categories, range, prime2_mask),
            )
        } else {
            let leftover = leftover_budget(&state.budgets, &state.ordered, order);
            let range = LegalRange::new(spatial_min(spmap, leftover, spatial_max), spatial_max);
            let mask = range_mask(categories, range, prime2_mask);
            (sample_masked(scores.spatial(b), &mask, range.min, rng), range, mask)
        };

        // Prime 2: at least the spatial share, at most what the other
        // levels' spatial maps leave over.
        let temporal = max_temporal_size(
            arch,
            episode,
            level,
            state.budgets.total_for_prime(0),
            spmap,
        );
        let primary_range = LegalRange::new(
            spatial.action,
            primary_cap.min(spatial.action.saturating_add(temporal)),
        );
        let primary_mask = range_mask(categories, primary_range, prime2_mask);
        let primary = sample_masked(scores.tile(b, 0), &primary_mask, primary_range.min, rng);

        let mut samples = vec![primary];
        let mut ranges = vec![primary_range];
        let mut masks = vec![primary_mask];

        // Remaining primes, each in the capacity left by the ones before.
        let mut prev = primary.action;
        for p in 1..arch.num_primes() {
            capacity /= prime_power(arch.primes[p - 1], prev);
            let max = exponent_cap(capacity, arch.primes[p], categories)
                .min(state.budgets.get(order, p));
            let range = LegalRange::upto(max);
            let mask = range_mask(categories, range, state.masks.tile_row(order, p));
            let sample = sample_masked(scores.tile(b, p), &mask, range.min, rng);
            prev = sample.action;
            samples.push(sample);
            ranges.push(range);
            masks.push(mask);
        }

        samples.push(spatial);
        ranges.push(spatial_range);
        masks.push(spatial_mask);

        let tiles: Vec<u32> = samples[..arch.num_primes()]
            .iter()
            .map(|s| s.action)
            .collect();
        let mut spatial_tiles = vec![0; arch.num_primes()];
        spatial_tiles[0] = spatial.action;

        trace!(
            "b={} level={} sub_step={} dim={} tiles={:?} spatial={} ranges={:?}",
            b,
            level,
            cursor.sub_step,
            order,
            tiles,
            spatial.action,
            ranges
        );

        ElementStep {
            tiles,
            parallel: spatial.action.min(1),
            spatial_tiles,
            samples,
            ranges,
            masks,
        }
    }

    fn check_inputs(
        &self,
        cursor: Cursor,
        batch: &[ElementState],
        scores: &StepScores,
    ) -> Result<(), PolicyError> {
        let arch = &self.arch;
        if cursor.level >= arch.num_levels() {
            return Err(PolicyError::LevelOutOfRange {
                level: cursor.level,
                levels: arch.num_levels(),
            });
        }
        if cursor.sub_step >= arch.steps_per_level {
            return Err(PolicyError::SubStepOutOfRange {
                sub_step: cursor.sub_step,
                steps: arch.steps_per_level,
            });
        }
        if scores.batch() != batch.len() {
            return Err(PolicyError::BatchMismatch {
                scores: scores.batch(),
                states: batch.len(),
            });
        }
        if scores.num_primes() != arch.num_primes() {
            return Err(PolicyError::PrimeCount {
                expected: arch.num_primes(),
                got: scores.num_primes(),
            });
        }
        if scores.categories() != arch.categories {
            return Err(PolicyError::CategoryCount {
                expected: arch.categories,
                got: scores.categories(),
            });
        }
        for state in batch {
            if state.program.num_levels() != arch.num_levels() {
                return Err(PolicyError::LevelOutOfRange {
                    level: state.program.num_levels(),
                    levels: arch.num_levels(),
                });
            }
            if let Some(dim) = Dim::ALL
                .into_iter()
                .find(|&d| state.budgets.row(d).len() != arch.num_primes())
            {
                return Err(PolicyError::PrimeCount {
                    expected: arch.num_primes(),
                    got: state.budgets.row(dim).len(),
                });
            }
            if state.program.num_primes() != arch.num_primes() {
                return Err(PolicyError::PrimeCount {
                    expected: arch.num_primes(),
                    got: state.program.num_primes(),
                });
            }
            if state.masks.categories != arch.categories
                || state.masks.num_primes != arch.num_primes()
            {
                return Err(PolicyError::CategoryCount {
                    expected: arch.categories,
                    got: state.masks.categories,
                });
            }
        }
        debug!(
            "step level={} sub_step={} batch={}",
            cursor.level,
            cursor.sub_step,
            batch.len()
        );
        Ok(())
    }
}
