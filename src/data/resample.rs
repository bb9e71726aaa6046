//! Surprise resampling of a raw iteration dataset.
//!
//! Samples the current model finds surprising are duplicated, easy ones are
//! dropped. Each sample gets weight `w_i = 0.5 + L_i / total * 0.5 * N` (mean 1)
//! and is emitted `floor(w_i)` times, plus once more with probability
//! `w_i - floor(w_i)`.

use std::fs;
use std::path::Path;

use rand::prelude::*;
use tch::{Device, Kind};

use crate::data::shard_store::{IterationDataset, ShardStore, ShardWriter};
use crate::neural::policy_value_net::PolicyValueModel;
use crate::training::losses::surprise;
use crate::{PipelineError, Result};

/// Completion marker written into a canonical iteration folder.
pub const MARKER_FILE: &str = "resample.txt";

/// Per-sample surprise `cv * L_v + L_pi` for every sample of `dataset`, in
/// discovery order. The model is evaluated without gradients.
pub fn sample_losses<M: PolicyValueModel>(
    model: &M,
    dataset: &IterationDataset,
    cv: f64,
    batch_size: usize,
) -> Result<Vec<f64>> {
    let device = model.device();
    let batch_size = batch_size.max(1);
    let mut losses = Vec::with_capacity(dataset.total_samples());
    let shard_count = dataset.shard_files().len();
    let log_every = (shard_count / 10).max(1);

    for (idx, shard) in dataset.shards().enumerate() {
        let shard = shard?;
        let mut start = 0;
        while start < shard.len() {
            let len = batch_size.min(shard.len() - start);
            let batch = shard.narrow(start, len).to_device(device);
            let scores = tch::no_grad(|| {
                let (out_v, out_pi) = model.forward_t(&batch.context.to_kind(Kind::Float), false);
                surprise(cv, &batch.value, &out_v, &batch.policy, &out_pi)
            });
            let scores = scores.to_kind(Kind::Double).to_device(Device::Cpu);
            let scores = Vec::<f64>::try_from(&scores)?;
            losses.extend(scores);
            start += len;
        }
        if (idx + 1) % log_every == 0 || idx + 1 == shard_count {
            log::info!("Loss calculation: {}/{} shards", idx + 1, shard_count);
        }
    }
    Ok(losses)
}

/// Turn losses into resampling weights averaging 1.
pub fn resample_weights(losses: &[f64]) -> Result<Vec<f64>> {
    if losses.is_empty() {
        return Err(PipelineError::NumericInstability(
            "cannot weight an empty dataset".to_string(),
        ));
    }
    let n = losses.len() as f64;
    let total: f64 = losses.iter().sum();
    let weights: Vec<f64> = losses
        .iter()
        .map(|loss| 0.5 + loss / total * 0.5 * n)
        .collect();

    if let Some(idx) = weights.iter().position(|w| w.is_nan()) {
        return Err(PipelineError::NumericInstability(format!(
            "resample weight of sample {} is NaN (loss={}, total={})",
            idx, losses[idx], total
        )));
    }
    Ok(weights)
}

/// Stochastic rounding: `floor(w)` plus one with probability `w - floor(w)`.
///
/// Draws exactly one number from `rng` per call.
pub fn stochastic_copies<R: Rng + ?Sized>(weight: f64, rng: &mut R) -> usize {
    let base = weight.floor();
    let extra = rng.random::<f64>() < weight - base;
    base.max(0.0) as usize + usize::from(extra)
}

/// Resample the dataset in `source` into `dest` and write the completion marker.
///
/// Returns the number of emitted samples. `source` is left untouched.
pub fn resample_by_surprise<M, R>(
    model: &M,
    store: &ShardStore,
    source: &Path,
    dest: &Path,
    cv: f64,
    rng: &mut R,
) -> Result<usize>
where
    M: PolicyValueModel,
    R: Rng + ?Sized,
{
    let dataset = store.read(source)?;
    let total_in = dataset.total_samples();
    if total_in == 0 {
        return Err(PipelineError::integrity(source, "dataset holds no samples"));
    }
    log::info!(
        "Resampling {} samples from {} shards in {}",
        total_in,
        dataset.shard_files().len(),
        source.display()
    );

    let losses = sample_losses(model, &dataset, cv, store.batch_size())?;
    if losses.len() != total_in {
        return Err(PipelineError::integrity(
            source,
            format!("scored {} samples, expected {}", losses.len(), total_in),
        ));
    }
    let weights = resample_weights(&losses)?;
    let expected: f64 = weights.iter().sum();
    log::info!("Expected resampled size: {:.0}", expected);

    let mut writer = ShardWriter::new(store, dest);
    let mut next = weights.iter();
    let shard_count = dataset.shard_files().len();
    let log_every = (shard_count / 10).max(1);
    for (idx, shard) in dataset.shards().enumerate() {
        let shard = shard?;
        for row in 0..shard.len() {
            let weight = next.next().copied().ok_or_else(|| {
                PipelineError::integrity(source, "dataset grew while resampling")
            })?;
            let copies = stochastic_copies(weight, rng);
            writer.push_row(&shard, row, copies)?;
        }
        if (idx + 1) % log_every == 0 || idx + 1 == shard_count {
            log::info!(
                "Resampling: {}/{} shards, {} samples written",
                idx + 1,
                shard_count,
                writer.samples_written()
            );
        }
    }
    let total_out = writer.finish()?;

    write_marker(dest, total_out)?;
    log::info!("Resampled {} -> {} samples into {}", total_in, total_out, dest.display());
    Ok(total_out)
}

/// Sample count recorded in `folder`'s marker, if resampling has completed.
pub fn read_marker(folder: &Path) -> Result<Option<usize>> {
    let path = folder.join(MARKER_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    let line = content.trim();
    let value = line.strip_prefix("total_out=").unwrap_or(line);
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| PipelineError::integrity(folder, format!("unreadable marker '{}'", line)))
}

fn write_marker(folder: &Path, total_out: usize) -> Result<()> {
    fs::create_dir_all(folder)?;
    let path = folder.join(MARKER_FILE);
    let tmp = folder.join(format!("{}.tmp", MARKER_FILE));
    fs::write(&tmp, format!("total_out={}\n", total_out))?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
