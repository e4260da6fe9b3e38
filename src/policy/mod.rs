//! Constrained autoregressive policy over tiling decisions.
//!
//! At every step the actor turns raw network scores into samples that
//! respect buffer capacity, spatial-map capacity, and the factorization
//! budget of each dimension. Illegal categories are masked out before
//! sampling, so no decision it returns can overflow a level.
//!
//! # Public API
//!
//! ```ignore
//! use dla_tiling::config::ArchConfig;
//! use dla_tiling::policy::{ElementState, FlatScores, Rollout, TilingActor};
//!
//! let arch = ArchConfig::tensor_core();
//! let budgets = problem.factorize(&arch.primes)?;
//! let actor = TilingActor::new(arch.clone())?;
//! let model = FlatScores { num_primes: 4, categories: 12 };
//! let states = vec![ElementState::new(&arch, budgets); 8];
//! let result = Rollout::new(&actor, &model).run(states, &mut rng)?;
//! ```

pub mod actor;
pub mod capacity;
pub mod episode;
pub mod range;
pub mod rollout;
pub mod sampler;
pub mod scores;

pub use actor::{loop_order, ElementState, ElementStep, StaticMasks, StepOutput, TilingActor};
pub use episode::{Cursor, Episode};
pub use range::LegalRange;
pub use rollout::{Rollout, RolloutResult, StepRecord, Trajectory};
pub use sampler::Sample;
pub use scores::{FlatScores, ScoreModel, StepScores};
