//! Reference environment driver.
//!
//! Walks every level and sub-step of one episode, feeding each step's
//! decisions back into the batch's programs and budgets. Every step is
//! kept in a `Trajectory`, indexed by step number, so the training loop
//! can read back exactly what was sampled and under which masks.

use burn::prelude::*;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

use super::actor::{ElementState, StepOutput, TilingActor};
use super::episode::{Cursor, Episode};
use super::scores::ScoreModel;

/// One step of a rollout: where it happened, the episode it was sampled
/// under, and what came out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub cursor: Cursor,
    pub episode: Episode,
    pub output: StepOutput,
}

/// Step records of one rollout, in step order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    steps: Vec<StepRecord>,
    batch: usize,
    /// Decisions per element and step (primes + spatial).
    width: usize,
}

impl Trajectory {
    pub fn new(batch: usize, num_primes: usize) -> Self {
        Self {
            steps: Vec::new(),
            batch,
            width: num_primes + 1,
        }
    }

    pub fn push(&mut self, record: StepRecord) {
        self.steps.push(record);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn get(&self, step: usize) -> Option<&StepRecord> {
        self.steps.get(step)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter()
    }

    /// Loop-order action of every step.
    pub fn orders(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.output.order.index()).collect()
    }

    /// Sum of credited log-probabilities of element `b`: each decision's
    /// log-probability times its validity weight.
    pub fn credited_log_prob(&self, b: usize) -> f32 {
        self.steps
            .iter()
            .filter_map(|s| s.output.elements.as_ref())
            .filter_map(|elements| elements.get(b))
            .flat_map(|e| e.samples.iter())
            .map(|s| s.log_prob * s.weight())
            .sum()
    }

    /// Log-probabilities as a `[steps, batch, primes + 1]` tensor.
    pub fn log_prob_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        self.stack(StepOutput::log_probs, device)
    }

    /// Validity weights as a `[steps, batch, primes + 1]` tensor.
    pub fn validity_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        self.stack(StepOutput::validity, device)
    }

    fn stack<B: Backend>(
        &self,
        rows: fn(&StepOutput) -> Vec<Vec<f32>>,
        device: &B::Device,
    ) -> Tensor<B, 3> {
        let data: Vec<f32> = self
            .steps
            .iter()
            .flat_map(|s| rows(&s.output).into_iter().flatten())
            .collect();
        Tensor::from_data(
            TensorData::new(data, [self.steps.len(), self.batch, self.width]),
            device,
        )
    }
}

/// Outcome of a full rollout.
#[derive(Clone, Debug)]
pub struct RolloutResult {
    pub trajectory: Trajectory,
    /// Final per-element state, terminal level included.
    pub states: Vec<ElementState>,
    /// Episode after the last step.
    pub episode: Episode,
}

/// Drives one actor with one score model over whole episodes.
pub struct Rollout<'a, M: ScoreModel> {
    actor: &'a TilingActor,
    model: &'a M,
}

impl<'a, M: ScoreModel> Rollout<'a, M> {
    pub fn new(actor: &'a TilingActor, model: &'a M) -> Self {
        Self { actor, model }
    }

    /// Run one episode from `initial` to the last sub-step of the
    /// terminal level.
    ///
    /// Sampled tiles are recorded into each element's program and charged
    /// to its budget. On the terminal level the active dimension absorbs
    /// whatever budget is still left.
    pub fn run<R: Rng + ?Sized>(
        &self,
        initial: Vec<ElementState>,
        rng: &mut R,
    ) -> Result<RolloutResult, PolicyError> {
        let arch = self.actor.arch();
        let steps = arch.steps_per_level;
        let levels = arch.num_levels();

        let mut trajectory = Trajectory::new(initial.len(), arch.num_primes());
        let mut states = initial;
        let mut episode = self.actor.episode();
        let mut cursor = Some(Cursor::start());

        while let Some(current) = cursor {
            let scores = self.model.scores(current, &states)?;
            let (output, next_episode) =
                self.actor.step(&episode, current, &states, &scores, rng)?;

            states = match &output.elements {
                Some(elements) => states
                    .iter()
                    .zip(elements)
                    .map(|(state, step)| {
                        state.apply(current.level, output.order, step.to_dim_tile())
                    })
                    .collect::<Result<_, _>>()?,
                None => states
                    .iter()
                    .map(|state| state.absorb_remaining(current.level, output.order))
                    .collect::<Result<_, _>>()?,
            };

            trajectory.push(StepRecord {
                cursor: current,
                episode,
                output,
            });
            episode = next_episode;

            cursor = current.advance(steps, levels);
            if let Some(next) = cursor {
                if next.level != current.level {
                    states = states.iter().map(ElementState::enter_level).collect();
                }
            }
        }

        debug!(
            "rollout done: {} steps, batch {}",
            trajectory.len(),
            trajectory.batch()
        );
        Ok(RolloutResult {
            trajectory,
            states,
            episode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchConfig;
    use crate::policy::scores::{FlatScores, StepScores};
    use crate::tiling::{Dim, ProblemInstance};
    use burn::backend::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn tensor_core_batch(n: usize) -> (TilingActor, Vec<ElementState>) {
        let arch = ArchConfig::tensor_core();
        let budgets = ProblemInstance::new(1, 512, 1152, 640)
            .factorize(&arch.primes)
            .unwrap();
        let states = (0..n)
            .map(|_| ElementState::new(&arch, budgets.clone()))
            .collect();
        (TilingActor::new(arch).unwrap(), states)
    }

    #[test]
    fn visits_every_step_once() {
        let (actor, states) = tensor_core_batch(3);
        let model = FlatScores {
            num_primes: 4,
            categories: 12,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();
        let trajectory = &result.trajectory;
        assert_eq!(trajectory.len(), 16);
        assert_eq!(trajectory.get(5).unwrap().cursor, Cursor::new(1, 1));
        assert!(trajectory.get(16).is_none());
        assert_eq!(trajectory.orders(), [0usize, 1, 3, 2].repeat(4));
        // only the terminal level is order-only
        let terminal: Vec<bool> = trajectory.iter().map(|s| s.output.is_terminal()).collect();
        assert_eq!(terminal.iter().filter(|&&t| t).count(), 4);
        assert!(terminal[12..].iter().all(|&t| t));
        // every non-terminal level ends up finished
        assert_eq!(result.episode.finished_levels().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn budgets_are_fully_distributed() {
        let (actor, states) = tensor_core_batch(4);
        let initial = states[0].budgets.clone();
        let model = FlatScores {
            num_primes: 4,
            categories: 12,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();
        let primes = &actor.arch().primes;
        for state in &result.states {
            assert!(state.budgets.is_exhausted());
            for dim in Dim::ALL {
                // exponents over all levels add back up to the problem size
                for p in 0..primes.len() {
                    let total: u32 = (0..4)
                        .map(|l| state.program.tile(l, dim).exponents[p])
                        .sum();
                    assert_eq!(total, initial.get(dim, p));
                }
            }
        }
    }

    #[test]
    fn episode_snapshots_are_recorded_per_step() {
        let (actor, states) = tensor_core_batch(1);
        let model = FlatScores {
            num_primes: 4,
            categories: 12,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();
        let first = result.trajectory.get(0).unwrap();
        assert_eq!(first.episode, actor.episode());
        // level 0 is finished for every step of level 1
        let later = result.trajectory.get(4).unwrap();
        assert!(later.episode.is_finished(0));
        assert!(!later.episode.is_finished(1));
    }

    #[test]
    fn tensors_have_step_batch_decision_shape() {
        let (actor, states) = tensor_core_batch(2);
        let model = FlatScores {
            num_primes: 4,
            categories: 12,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();
        let device = Default::default();
        let log_probs = result.trajectory.log_prob_tensor::<NdArray>(&device);
        let validity = result.trajectory.validity_tensor::<NdArray>(&device);
        assert_eq!(log_probs.dims(), [16, 2, 5]);
        assert_eq!(validity.dims(), [16, 2, 5]);

        let credited: Vec<f32> = (log_probs * validity)
            .sum_dim(2)
            .sum_dim(0)
            .into_data()
            .to_vec()
            .unwrap();
        for b in 0..2 {
            let expected = result.trajectory.credited_log_prob(b);
            assert!((credited[b] - expected).abs() < 1e-3);
            assert!(expected <= 0.0);
        }
    }

    struct Failing;

    impl ScoreModel for Failing {
        fn scores(&self, cursor: Cursor, batch: &[ElementState]) -> Result<StepScores, PolicyError> {
            if cursor.level == 1 {
                return Err(PolicyError::Tensor("model unavailable".to_string()));
            }
            Ok(StepScores::zeros(batch.len(), 4, 12))
        }
    }

    #[test]
    fn model_errors_abort_the_rollout() {
        let (actor, states) = tensor_core_batch(1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = Rollout::new(&actor, &Failing).run(states, &mut rng).unwrap_err();
        assert!(matches!(err, PolicyError::Tensor(_)));
    }

    #[test]
    fn wrong_model_shape_is_rejected() {
        let (actor, states) = tensor_core_batch(2);
        let model = FlatScores {
            num_primes: 3,
            categories: 12,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            Rollout::new(&actor, &model).run(states, &mut rng),
            Err(PolicyError::PrimeCount { .. })
        ));
    }
}
