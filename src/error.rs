//! Error types for configuration loading and step inputs.
//!
//! Sampling itself never fails: degenerate budgets are absorbed by
//! clamps. These errors report structurally malformed inputs.

use std::path::PathBuf;

use thiserror::Error;

use crate::tiling::Dim;

/// Errors raised while loading or validating an architecture config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read arch config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value in the config text could not be parsed.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    /// The config parsed but describes an unusable architecture.
    #[error("invalid arch config: {0}")]
    Invalid(String),

    /// No built-in preset with this name.
    #[error("unknown arch '{0}' (available: tensor_core)")]
    UnknownArch(String),
}

/// Errors raised when step inputs do not match the configured shapes.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Level index outside the configured hierarchy.
    #[error("level {level} out of range ({levels} levels configured)")]
    LevelOutOfRange { level: usize, levels: usize },

    /// Sub-step index outside `0..steps_per_level`.
    #[error("sub-step {sub_step} out of range ({steps} per level)")]
    SubStepOutOfRange { sub_step: usize, steps: usize },

    /// Per-prime data with the wrong number of primes.
    #[error("expected {expected} primes, got {got}")]
    PrimeCount { expected: usize, got: usize },

    /// Score or mask rows with the wrong number of categories.
    #[error("expected {expected} categories, got {got}")]
    CategoryCount { expected: usize, got: usize },

    /// Score batch and state batch disagree.
    #[error("score batch has {scores} rows but {states} element states were given")]
    BatchMismatch { scores: usize, states: usize },

    /// A workload size has a factor outside the prime basis.
    #[error("dimension {dim} has residue {residue} outside the prime basis")]
    Unfactorable { dim: Dim, residue: u64 },

    /// Tensor data could not be read back from the backend.
    #[error("tensor readback failed: {0}")]
    Tensor(String),
}
