//! Action sampling for a reinforcement-learning agent that searches
//! loop-nest tilings of a GEMM-like workload on a multi-level accelerator
//! memory hierarchy.

pub mod config;
pub mod error;
pub mod policy;
pub mod tiling;

pub use config::{ArchConfig, LevelConfig, LevelKind, Operand, Residency};
pub use error::{ConfigError, PolicyError};
pub use policy::{Cursor, Episode, Rollout, TilingActor};
pub use tiling::{Dim, DimBudgets, DimTile, ProblemInstance, TilingProgram};
