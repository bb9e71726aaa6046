//! Replay window: how many past iterations feed one training pass.

use std::ops::RangeInclusive;

use crate::config::{PipelineConfig, WindowCurve};
use crate::data::shard_store::{SampleBatch, ShardStore};
use crate::{PipelineError, Result};

/// Number of past iterations reused when training on iteration `iteration`.
///
/// Grows almost linearly at first and flattens out around `scalar` iterations.
/// Non-decreasing in `iteration` whenever `alpha` and `beta` are positive.
pub fn hist_size(iteration: u32, curve: &WindowCurve) -> u32 {
    let x = (iteration as f64 + 1.0) / curve.scalar;
    let raw = curve.scalar * (1.0 + curve.beta * (x.powf(curve.alpha) - 1.0) / curve.alpha);
    let size = raw.floor() as i64 - curve.lag_adjustment as i64;
    size.max(0) as u32
}

/// Iterations `[max(0, i - hist_size(i)), i]`.
pub fn window_range(iteration: u32, curve: &WindowCurve) -> RangeInclusive<u32> {
    let start = iteration.saturating_sub(hist_size(iteration, curve));
    start..=iteration
}

/// Concatenated canonical datasets of one window.
#[derive(Debug)]
pub struct WindowDataset {
    pub iterations: RangeInclusive<u32>,
    pub samples: SampleBatch,
}

impl WindowDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Load every canonical dataset of the window ending at `iteration`.
///
/// Fails if any folder in the window is missing or inconsistent.
pub fn assemble_window(
    store: &ShardStore,
    config: &PipelineConfig,
    iteration: u32,
) -> Result<WindowDataset> {
    let iterations = window_range(iteration, &config.window);
    log::info!(
        "Current history size: {} (iterations {}..={})",
        hist_size(iteration, &config.window),
        iterations.start(),
        iterations.end()
    );

    let mut parts = Vec::new();
    for it in iterations.clone() {
        let folder = config.iteration_dir(it);
        if !folder.is_dir() {
            return Err(PipelineError::DatasetMissing {
                iteration: it,
                folder,
            });
        }
        let dataset = store.read(&folder)?;
        let samples = dataset.load_all()?;
        log::debug!("Iteration {:04}: {} samples", it, samples.len());
        parts.push(samples);
    }

    Ok(WindowDataset {
        iterations,
        samples: SampleBatch::cat(&parts),
    })
}
