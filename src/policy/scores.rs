//! Score inputs from the scoring network, and the tensor-side helpers the
//! training loop uses to re-evaluate sampled decisions differentiably.

use burn::prelude::*;
use burn::tensor::activation;

use crate::error::PolicyError;

use super::actor::ElementState;
use super::episode::Cursor;

/// Finite stand-in for `-inf` when masks cross into tensors, so masked
/// logits keep finite gradients.
pub const MASK_PENALTY: f32 = -1e9;

/// Raw per-category scores for one step of a batch.
///
/// `tile` is laid out `[batch, primes, categories]`, `spatial` is
/// `[batch, categories]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StepScores {
    batch: usize,
    num_primes: usize,
    categories: usize,
    tile: Vec<f32>,
    spatial: Vec<f32>,
}

impl StepScores {
    pub fn new(
        batch: usize,
        num_primes: usize,
        categories: usize,
        tile: Vec<f32>,
        spatial: Vec<f32>,
    ) -> Result<Self, PolicyError> {
        if tile.len() != batch * num_primes * categories {
            return Err(PolicyError::CategoryCount {
                expected: batch * num_primes * categories,
                got: tile.len(),
            });
        }
        if spatial.len() != batch * categories {
            return Err(PolicyError::CategoryCount {
                expected: batch * categories,
                got: spatial.len(),
            });
        }
        Ok(Self {
            batch,
            num_primes,
            categories,
            tile,
            spatial,
        })
    }

    /// All-zero scores: a uniform distribution over whatever is legal.
    pub fn zeros(batch: usize, num_primes: usize, categories: usize) -> Self {
        Self {
            batch,
            num_primes,
            categories,
            tile: vec![0.0; batch * num_primes * categories],
            spatial: vec![0.0; batch * categories],
        }
    }

    /// Read scores back from network output tensors.
    ///
    /// - `tile`: [batch, primes, categories]
    /// - `spatial`: [batch, categories]
    pub fn from_tensors<B: Backend>(
        tile: Tensor<B, 3>,
        spatial: Tensor<B, 2>,
    ) -> Result<Self, PolicyError> {
        let [batch, num_primes, categories] = tile.dims();
        let [spatial_batch, spatial_categories] = spatial.dims();
        if spatial_batch != batch {
            return Err(PolicyError::BatchMismatch {
                scores: batch,
                states: spatial_batch,
            });
        }
        if spatial_categories != categories {
            return Err(PolicyError::CategoryCount {
                expected: categories,
                got: spatial_categories,
            });
        }
        let tile: Vec<f32> = tile
            .into_data()
            .to_vec()
            .map_err(|e| PolicyError::Tensor(format!("{:?}", e)))?;
        let spatial: Vec<f32> = spatial
            .into_data()
            .to_vec()
            .map_err(|e| PolicyError::Tensor(format!("{:?}", e)))?;
        Self::new(batch, num_primes, categories, tile, spatial)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_primes(&self) -> usize {
        self.num_primes
    }

    pub fn categories(&self) -> usize {
        self.categories
    }

    /// Scores for prime `p` of element `b`.
    pub fn tile(&self, b: usize, p: usize) -> &[f32] {
        let start = (b * self.num_primes + p) * self.categories;
        &self.tile[start..start + self.categories]
    }

    /// Spatial-tile scores of element `b`.
    pub fn spatial(&self, b: usize) -> &[f32] {
        let start = b * self.categories;
        &self.spatial[start..start + self.categories]
    }
}

/// The scoring network seam: history in, per-step score vectors out.
pub trait ScoreModel {
    fn scores(&self, cursor: Cursor, batch: &[ElementState]) -> Result<StepScores, PolicyError>;
}

/// Uniform scores for every decision. Samples uniformly among legal
/// categories; useful as a baseline policy.
#[derive(Clone, Copy, Debug)]
pub struct FlatScores {
    pub num_primes: usize,
    pub categories: usize,
}

impl ScoreModel for FlatScores {
    fn scores(&self, _cursor: Cursor, batch: &[ElementState]) -> Result<StepScores, PolicyError> {
        Ok(StepScores::zeros(
            batch.len(),
            self.num_primes,
            self.categories,
        ))
    }
}

/// Stack additive masks into a `[rows, categories]` tensor, replacing
/// `-inf` with `MASK_PENALTY`.
pub fn mask_tensor<B: Backend>(
    masks: &[Vec<f32>],
    categories: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let data: Vec<f32> = masks
        .iter()
        .flat_map(|row| row.iter().map(|&m| m.max(MASK_PENALTY)))
        .collect();
    Tensor::from_data(TensorData::new(data, [masks.len(), categories]), device)
}

/// `log softmax(logits + mask)[action]` per row.
///
/// - `logits`: [rows, categories]
/// - `masks`: [rows, categories], finite (see `mask_tensor`)
/// - `actions`: [rows]
///
/// Differentiable in `logits`; the training loop recomputes sampled
/// decisions' log-probabilities with this.
pub fn masked_log_prob<B: Backend>(
    logits: Tensor<B, 2>,
    masks: Tensor<B, 2>,
    actions: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits + masks, 1);
    let index: Tensor<B, 2, Int> = actions.unsqueeze_dim::<2>(1);
    log_probs.gather(1, index).squeeze_dim::<1>(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::sampler::sample_masked;
    use burn::backend::{Autodiff, NdArray};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn rows_are_sliced_by_element_and_prime() {
        let tile: Vec<f32> = (0..2 * 3 * 4).map(|v| v as f32).collect();
        let spatial: Vec<f32> = (0..2 * 4).map(|v| v as f32 * 10.0).collect();
        let scores = StepScores::new(2, 3, 4, tile, spatial).unwrap();
        assert_eq!(scores.tile(0, 0), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(scores.tile(1, 2), &[20.0, 21.0, 22.0, 23.0]);
        assert_eq!(scores.spatial(1), &[40.0, 50.0, 60.0, 70.0]);
    }

    #[test]
    fn new_rejects_wrong_lengths() {
        assert!(StepScores::new(2, 3, 4, vec![0.0; 23], vec![0.0; 8]).is_err());
        assert!(StepScores::new(2, 3, 4, vec![0.0; 24], vec![0.0; 7]).is_err());
    }

    #[test]
    fn from_tensors_matches_layout() {
        let device = Default::default();
        let tile_data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let tile =
            Tensor::<NdArray, 3>::from_data(TensorData::new(tile_data, [1, 3, 4]), &device);
        let spatial =
            Tensor::<NdArray, 2>::from_data(TensorData::new(vec![1.0f32; 4], [1, 4]), &device);
        let scores = StepScores::from_tensors(tile, spatial).unwrap();
        assert_eq!(scores.batch(), 1);
        assert_eq!(scores.num_primes(), 3);
        assert_eq!(scores.categories(), 4);
        assert_eq!(scores.tile(0, 1), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(scores.spatial(0), &[1.0; 4]);
    }

    #[test]
    fn from_tensors_rejects_mismatched_batch() {
        let device = Default::default();
        let tile = Tensor::<NdArray, 3>::zeros([2, 1, 4], &device);
        let spatial = Tensor::<NdArray, 2>::zeros([3, 4], &device);
        assert!(matches!(
            StepScores::from_tensors(tile, spatial),
            Err(PolicyError::BatchMismatch { .. })
        ));
    }

    #[test]
    fn tensor_log_prob_agrees_with_sampler() {
        let device = Default::default();
        let scores = vec![0.5f32, 1.5, -0.5, 2.0];
        let mask = vec![f32::NEG_INFINITY, 0.0, 0.0, f32::NEG_INFINITY];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let sample = sample_masked(&scores, &mask, 0, &mut rng);

        let logits =
            Tensor::<NdArray, 2>::from_data(TensorData::new(scores.clone(), [1, 4]), &device);
        let masks = mask_tensor::<NdArray>(&[mask], 4, &device);
        let actions = Tensor::<NdArray, 1, Int>::from_data(
            TensorData::new(vec![sample.action as i32], [1]),
            &device,
        );
        let lp: Vec<f32> = masked_log_prob(logits, masks, actions)
            .into_data()
            .to_vec()
            .unwrap();
        assert!((lp[0] - sample.log_prob).abs() < 1e-5);
    }

    #[test]
    fn masked_entries_get_no_gradient() {
        type AB = Autodiff<NdArray>;
        let device = Default::default();
        let logits = Tensor::<AB, 2>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 0.0, 0.0], [1, 4]),
            &device,
        )
        .require_grad();
        let masks = mask_tensor::<AB>(&[vec![0.0, 0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]], 4, &device);
        let actions =
            Tensor::<AB, 1, Int>::from_data(TensorData::new(vec![1i32], [1]), &device);
        let lp = masked_log_prob(logits.clone(), masks, actions);
        let value: Vec<f32> = lp.clone().into_data().to_vec().unwrap();
        assert!((value[0] - 0.5f32.ln()).abs() < 1e-5);

        let grads = lp.sum().backward();
        let grad: Vec<f32> = logits.grad(&grads).unwrap().into_data().to_vec().unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!((grad[0] + 0.5).abs() < 1e-5);
        assert!((grad[1] - 0.5).abs() < 1e-5);
        assert!(grad[2].abs() < 1e-6 && grad[3].abs() < 1e-6);
    }

    #[test]
    fn flat_scores_are_zero() {
        let model = FlatScores {
            num_primes: 2,
            categories: 3,
        };
        let scores = model.scores(Cursor::start(), &[]).unwrap();
        assert_eq!(scores.batch(), 0);
        assert_eq!(scores, StepScores::zeros(0, 2, 3));
    }
}
