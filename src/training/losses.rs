//! Soft-target cross-entropy losses.
//!
//! Model outputs are log-probabilities, targets are probability distributions.

use tch::{Kind, Tensor};

/// Per-sample loss `-sum_k target[k] * log_prob[k]`, shape `[N]`.
pub fn sample_cross_entropy(targets: &Tensor, log_probs: &Tensor) -> Tensor {
    -(targets * log_probs).sum_dim_intlist([1].as_ref(), false, Kind::Float)
}

/// Batch-averaged soft-target cross-entropy (scalar).
pub fn batch_cross_entropy(targets: &Tensor, log_probs: &Tensor) -> Tensor {
    let batch = targets.size().first().copied().unwrap_or(1).max(1);
    -(targets * log_probs).sum(Kind::Float) / batch as f64
}

/// Per-sample surprise `cv * value_loss + policy_loss`, shape `[N]`.
pub fn surprise(
    cv: f64,
    target_v: &Tensor,
    out_v: &Tensor,
    target_pi: &Tensor,
    out_pi: &Tensor,
) -> Tensor {
    sample_cross_entropy(target_v, out_v) * cv + sample_cross_entropy(target_pi, out_pi)
}
