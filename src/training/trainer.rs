//! One model update over the replay window.
//!
//! ```text
//! Idle -> Training(step) -> SnapshotMerge -> ScheduleAdvance -> Idle
//! ```
//!
//! Snapshots of the trainable parameters are taken every `steps / 4` steps and
//! once more at the end, then folded together with [`merge_snapshots`] and
//! written back into the model before the schedule advances.

use rand::prelude::*;
use tch::{Device, Kind};

use crate::data::shard_store::SampleBatch;
use crate::neural::policy_value_net::PolicyValueModel;
use crate::training::losses::batch_cross_entropy;
use crate::training::optimizer::{LambdaScheduler, Sgd};
use crate::training::snapshot::{merge_snapshots, ParamSnapshot};
use crate::{PipelineError, Result};

/// Number of gradient steps for a window of `total_samples`:
/// `ceil(total_samples / batch_size * sample_rate)`.
pub fn training_steps(total_samples: usize, batch_size: usize, sample_rate: f64) -> usize {
    (total_samples as f64 / batch_size as f64 * sample_rate).ceil() as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    Training { step: usize },
    SnapshotMerge,
    ScheduleAdvance,
}

/// Summary of one update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub steps: usize,
    pub snapshots: usize,
    pub mean_value_loss: f64,
    pub mean_policy_loss: f64,
    pub learning_rate: f64,
}

impl TrainReport {
    pub fn mean_total_loss(&self, cv: f64) -> f64 {
        cv * self.mean_value_loss + self.mean_policy_loss
    }
}

/// Endless shuffled mini-batches over a fixed sample set.
///
/// Each pass visits every sample once in a fresh random order; the last batch of
/// a pass may be short.
pub struct BatchSampler<'a, R: Rng> {
    samples: &'a SampleBatch,
    batch_size: usize,
    order: Vec<i64>,
    cursor: usize,
    rng: &'a mut R,
}

impl<'a, R: Rng> BatchSampler<'a, R> {
    pub fn new(samples: &'a SampleBatch, batch_size: usize, rng: &'a mut R) -> Self {
        let order: Vec<i64> = (0..samples.len() as i64).collect();
        let mut sampler = Self {
            samples,
            batch_size,
            order,
            cursor: 0,
            rng,
        };
        sampler.order.shuffle(&mut *sampler.rng);
        sampler
    }

    pub fn next_batch(&mut self) -> Option<SampleBatch> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut *self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.samples.select(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

pub struct ModelUpdateTrainer {
    cv: f64,
    batch_size: usize,
    device: Device,
    phase: TrainerPhase,
}

impl ModelUpdateTrainer {
    pub fn new(cv: f64, batch_size: usize, device: Device) -> Self {
        Self {
            cv,
            batch_size,
            device,
            phase: TrainerPhase::Idle,
        }
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Run `steps` gradient steps over `samples`, merge the snapshots into `model`
    /// and advance `scheduler` by one epoch.
    ///
    /// A non-finite loss aborts the update with
    /// [`PipelineError::NumericInstability`]; the model is left as trained so far
    /// and must not be checkpointed.
    pub fn train<M, R>(
        &mut self,
        model: &mut M,
        optimizer: &mut Sgd,
        scheduler: &mut LambdaScheduler,
        samples: &SampleBatch,
        steps: usize,
        rng: &mut R,
    ) -> Result<TrainReport>
    where
        M: PolicyValueModel,
        R: Rng,
    {
        let interval = steps / 4;
        let log_every = (steps / 10).max(1);
        let mut sampler = BatchSampler::new(samples, self.batch_size, rng);
        let mut snapshots = Vec::new();
        let mut v_loss_sum = 0.0;
        let mut pi_loss_sum = 0.0;

        log::info!(
            "Training on {} samples for {} steps (lr={:.2e})",
            samples.len(),
            steps,
            optimizer.lr()
        );

        for step in 0..steps {
            self.phase = TrainerPhase::Training { step };
            if interval > 0 && step > 0 && step % interval == 0 {
                snapshots.push(ParamSnapshot::capture(model.var_store()));
            }

            let batch = match sampler.next_batch() {
                Some(batch) => batch.to_device(self.device),
                None => {
                    self.phase = TrainerPhase::Idle;
                    return Err(PipelineError::Configuration(
                        "cannot train on an empty window".to_string(),
                    ));
                }
            };

            optimizer.zero_grad();
            let (out_v, out_pi) = model.forward_t(&batch.context.to_kind(Kind::Float), true);
            let l_v = batch_cross_entropy(&batch.value, &out_v);
            let l_pi = batch_cross_entropy(&batch.policy, &out_pi);
            let total = &l_pi + &l_v * self.cv;

            let l_v_value = l_v.double_value(&[]);
            let l_pi_value = l_pi.double_value(&[]);
            if !l_v_value.is_finite() || !l_pi_value.is_finite() {
                log::error!(
                    "Non-finite loss at step {}: v={} pi={}",
                    step,
                    l_v_value,
                    l_pi_value
                );
                self.phase = TrainerPhase::Idle;
                return Err(PipelineError::NumericInstability(format!(
                    "loss became non-finite at step {} (v={}, pi={})",
                    step, l_v_value, l_pi_value
                )));
            }

            total.backward();
            optimizer.step();

            v_loss_sum += l_v_value;
            pi_loss_sum += l_pi_value;
            let done = (step + 1) as f64;
            if (step + 1) % log_every == 0 || step + 1 == steps {
                log::info!(
                    "step {}/{} | v loss {:.4} | pi loss {:.4} | total {:.4}",
                    step + 1,
                    steps,
                    v_loss_sum / done,
                    pi_loss_sum / done,
                    (self.cv * v_loss_sum + pi_loss_sum) / done
                );
            }
        }

        self.phase = TrainerPhase::SnapshotMerge;
        snapshots.push(ParamSnapshot::capture(model.var_store()));
        let merged = merge_snapshots(&snapshots)?;
        merged.apply_to(model.var_store_mut())?;
        log::debug!("Merged {} weight snapshots", snapshots.len());

        self.phase = TrainerPhase::ScheduleAdvance;
        scheduler.step(optimizer);
        log::info!("Current learn rate={:.3e}", scheduler.current_lr());

        self.phase = TrainerPhase::Idle;
        let denom = steps.max(1) as f64;
        Ok(TrainReport {
            steps,
            snapshots: snapshots.len(),
            mean_value_loss: v_loss_sum / denom,
            mean_policy_loss: pi_loss_sum / denom,
            learning_rate: scheduler.current_lr(),
        })
    }
}
