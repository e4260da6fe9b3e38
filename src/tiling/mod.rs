//! Tiling program model: canonical loop dimensions, per-level tile
//! decisions, and the factorization budgets they draw from.
//!
//! A tile size is a product of small-prime powers, so every decision is
//! stored as one exponent per prime of the configured basis. Programs are
//! values: recording a decision returns a new program and leaves the
//! original untouched, so earlier step states stay valid.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Number of canonical loop dimensions.
pub const NUM_DIMS: usize = 4;

/// Canonical loop dimension of the tiled GEMM-like workload.
///
/// Operand volumes are defined over these: input = H·M·K,
/// weight = H·K·N, output = H·M·N.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Dim {
    H = 0,
    M = 1,
    K = 2,
    N = 3,
}

impl Dim {
    pub const ALL: [Dim; NUM_DIMS] = [Dim::H, Dim::M, Dim::K, Dim::N];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Dim> {
        Self::ALL.get(idx).copied()
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dim::H => "H",
            Dim::M => "M",
            Dim::K => "K",
            Dim::N => "N",
        };
        f.write_str(name)
    }
}

/// `prime^exp` as a float. Exact for every size the tiler produces.
pub fn prime_power(prime: u32, exp: u32) -> f64 {
    (prime as f64).powi(exp as i32)
}

/// One dimension's decision at one memory level.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimTile {
    /// Exponent per prime of the basis (index-aligned with `ArchConfig::primes`).
    pub exponents: Vec<u32>,
    /// 1 if the dimension is spread across parallel lanes at this level.
    pub parallel: u32,
    /// Exponent of two for the spatial (parallel) share of the tile.
    pub spatial: u32,
}

impl DimTile {
    /// An undecided cell: every exponent zero, no parallel use.
    pub fn zero(num_primes: usize) -> Self {
        Self {
            exponents: vec![0; num_primes],
            parallel: 0,
            spatial: 0,
        }
    }

    /// Tile size as the product of `prime^exponent` over the basis.
    pub fn size(&self, primes: &[u32]) -> f64 {
        primes
            .iter()
            .zip(&self.exponents)
            .map(|(&p, &e)| prime_power(p, e))
            .product()
    }

    /// Parallel lanes this cell occupies in the level's spatial map (>= 1).
    pub fn spatial_lanes(&self) -> f64 {
        (self.parallel as f64 * prime_power(2, self.spatial)).max(1.0)
    }
}

/// Tiling history of one batch element: a `[level][dim]` grid of decisions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingProgram {
    num_primes: usize,
    levels: Vec<[DimTile; NUM_DIMS]>,
}

impl TilingProgram {
    /// An empty program for `num_levels` memory levels.
    pub fn new(num_levels: usize, num_primes: usize) -> Self {
        let levels = (0..num_levels)
            .map(|_| std::array::from_fn(|_| DimTile::zero(num_primes)))
            .collect();
        Self { num_primes, levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_primes(&self) -> usize {
        self.num_primes
    }

    pub fn level(&self, level: usize) -> &[DimTile; NUM_DIMS] {
        &self.levels[level]
    }

    pub fn tile(&self, level: usize, dim: Dim) -> &DimTile {
        &self.levels[level][dim.index()]
    }

    /// Return a copy of this program with `tile` stored at `(level, dim)`.
    pub fn record(&self, level: usize, dim: Dim, tile: DimTile) -> Result<Self, PolicyError> {
        if level >= self.levels.len() {
            return Err(PolicyError::LevelOutOfRange {
                level,
                levels: self.levels.len(),
            });
        }
        if tile.exponents.len() != self.num_primes {
            return Err(PolicyError::PrimeCount {
                expected: self.num_primes,
                got: tile.exponents.len(),
            });
        }
        let mut next = self.clone();
        next.levels[level][dim.index()] = tile;
        Ok(next)
    }

    /// Cumulative tile size of each dimension over levels `0..=level`.
    ///
    /// This is the footprint a buffer at `level` must hold, since it
    /// contains every inner level's tile as well as its own.
    pub fn cumulative_sizes(&self, level: usize, primes: &[u32]) -> [f64; NUM_DIMS] {
        let mut sizes = [1.0f64; NUM_DIMS];
        for cells in self.levels.iter().take(level + 1) {
            for (size, cell) in sizes.iter_mut().zip(cells) {
                *size *= cell.size(primes);
            }
        }
        sizes
    }
}

/// Remaining factorization budget: `[dim][prime]` exponent clicks still
/// allocatable anywhere in the hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimBudgets {
    per_dim: [Vec<u32>; NUM_DIMS],
}

impl DimBudgets {
    pub fn new(per_dim: [Vec<u32>; NUM_DIMS]) -> Self {
        Self { per_dim }
    }

    /// Same budget `clicks` for every dimension and prime.
    pub fn uniform(num_primes: usize, clicks: u32) -> Self {
        Self {
            per_dim: std::array::from_fn(|_| vec![clicks; num_primes]),
        }
    }

    /// Width of the first row; rows are not checked against each other.
    pub fn num_primes(&self) -> usize {
        self.per_dim[0].len()
    }

    pub fn get(&self, dim: Dim, prime_idx: usize) -> u32 {
        self.per_dim[dim.index()][prime_idx]
    }

    pub fn row(&self, dim: Dim) -> &[u32] {
        &self.per_dim[dim.index()]
    }

    /// Sum over dimensions of the budget for one prime.
    pub fn total_for_prime(&self, prime_idx: usize) -> u32 {
        self.per_dim.iter().map(|row| row[prime_idx]).sum()
    }

    /// Return the budget left after `dim` consumed `exponents`.
    /// Saturates at zero.
    pub fn consume(&self, dim: Dim, exponents: &[u32]) -> Self {
        let mut next = self.clone();
        for (left, &used) in next.per_dim[dim.index()].iter_mut().zip(exponents) {
            *left = left.saturating_sub(used);
        }
        next
    }

    pub fn is_exhausted(&self) -> bool {
        self.per_dim.iter().all(|row| row.iter().all(|&b| b == 0))
    }
}

/// Workload sizes of the four canonical dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemInstance {
    pub sizes: [u64; NUM_DIMS],
}

impl ProblemInstance {
    pub fn new(h: u64, m: u64, k: u64, n: u64) -> Self {
        Self {
            sizes: [h, m, k, n],
        }
    }

    /// Initial budgets: the exponent of each prime in each dimension size.
    ///
    /// Fails if a size has a factor outside the prime basis, since no
    /// product of basis powers could ever tile it exactly.
    pub fn factorize(&self, primes: &[u32]) -> Result<DimBudgets, PolicyError> {
        let mut per_dim: [Vec<u32>; NUM_DIMS] = std::array::from_fn(|_| vec![0; primes.len()]);
        for dim in Dim::ALL {
            let mut rest = self.sizes[dim.index()];
            if rest == 0 {
                return Err(PolicyError::Unfactorable { dim, residue: 0 });
            }
            for (p, &prime) in primes.iter().enumerate() {
                let prime = prime as u64;
                while rest % prime == 0 {
                    rest /= prime;
                    per_dim[dim.index()][p] += 1;
                }
            }
            if rest != 1 {
                return Err(PolicyError::Unfactorable { dim, residue: rest });
            }
        }
        Ok(DimBudgets::new(per_dim))
    }
}
