//! Masked categorical sampling over one decision's score vector.

use log::warn;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One categorical decision: the chosen index, its log-probability under
/// the masked softmax, and whether the choice was a real one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub action: u32,
    pub log_prob: f32,
    /// False when at most one category was legal; such decisions carry
    /// no policy-gradient credit.
    pub valid: bool,
}

impl Sample {
    /// A deterministic decision: probability one, no gradient credit.
    pub fn forced(action: u32) -> Self {
        Self {
            action,
            log_prob: 0.0,
            valid: false,
        }
    }

    /// Validity as the 0/1 weight the training loop multiplies in.
    pub fn weight(&self) -> f32 {
        if self.valid {
            1.0
        } else {
            0.0
        }
    }
}

/// A logit still in play: masked entries are `-inf`, and NaN never wins.
fn admissible(logit: f32) -> bool {
    logit != f32::NEG_INFINITY && !logit.is_nan()
}

/// Log-softmax of `scores + mask`, `-inf` for excluded categories.
/// `None` when every category is masked.
///
/// A `+inf` logit means certain selection: the mass is split evenly over
/// the `+inf` entries and every finite entry gets none.
pub fn masked_log_softmax(scores: &[f32], mask: &[f32]) -> Option<Vec<f32>> {
    let logits: Vec<f32> = scores.iter().zip(mask).map(|(s, m)| s + m).collect();
    let certain = logits.iter().filter(|&&l| l == f32::INFINITY).count();
    if certain > 0 {
        let share = -(certain as f32).ln();
        return Some(
            logits
                .iter()
                .map(|&l| if l == f32::INFINITY { share } else { f32::NEG_INFINITY })
                .collect(),
        );
    }
    let max = logits
        .iter()
        .copied()
        .filter(|&l| admissible(l))
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return None;
    }
    let total: f32 = logits
        .iter()
        .filter(|&&l| admissible(l))
        .map(|&l| (l - max).exp())
        .sum();
    let norm = max + total.ln();
    Some(
        logits
            .iter()
            .map(|&l| if admissible(l) { l - norm } else { f32::NEG_INFINITY })
            .collect(),
    )
}

/// Softmax of `scores + mask`. `None` when every category is masked.
pub fn masked_softmax(scores: &[f32], mask: &[f32]) -> Option<Vec<f32>> {
    masked_log_softmax(scores, mask).map(|lp| lp.into_iter().map(f32::exp).collect())
}

/// Draw one category from `softmax(scores + mask)`.
///
/// If the mask leaves nothing legal the decision is forced to
/// `fallback` (the range minimum, clamped into the category range) with
/// zero log-probability and no credit.
pub fn sample_masked<R: Rng + ?Sized>(
    scores: &[f32],
    mask: &[f32],
    fallback: u32,
    rng: &mut R,
) -> Sample {
    let top = scores.len().saturating_sub(1) as u32;
    let forced = || {
        warn!(
            "empty legal range over {} categories, forcing {}",
            scores.len(),
            fallback.min(top)
        );
        Sample::forced(fallback.min(top))
    };

    let Some(log_probs) = masked_log_softmax(scores, mask) else {
        return forced();
    };
    let weights: Vec<f32> = log_probs.iter().map(|lp| lp.exp()).collect();
    let Ok(dist) = WeightedIndex::new(&weights) else {
        return forced();
    };
    let action = dist.sample(rng);
    let support = log_probs.iter().filter(|&&lp| lp > f32::NEG_INFINITY).count();

    Sample {
        action: action as u32,
        log_prob: log_probs[action],
        valid: support > 1,
    }
}
