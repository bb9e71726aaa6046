//! Per-iteration orchestration.
//!
//! ```text
//! load checkpoint i -> resample gate -> window assembly -> step count
//!                   -> model update -> save checkpoint i + 1
//! ```
//!
//! Every failure aborts the iteration before checkpoint `i + 1` is written.

use std::fs;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use rand::prelude::*;
use rand::rngs::StdRng;
use tch::Device;

use crate::config::{NetArgs, PipelineConfig};
use crate::data::resample::{read_marker, resample_by_surprise};
use crate::data::shard_store::{SampleShape, ShardStore};
use crate::data::window::assemble_window;
use crate::neural::checkpoint::{CheckpointManager, TrainingState};
use crate::neural::policy_value_net::PolicyValueModel;
use crate::training::trainer::{training_steps, ModelUpdateTrainer, TrainReport};
use crate::{PipelineError, Result};

/// CUDA device 0, or the CPU when `allow_cpu` is set and no GPU is present.
pub fn select_device(allow_cpu: bool) -> Result<Device> {
    if tch::Cuda::is_available() {
        log::info!("🚀 CUDA available ({} device(s))", tch::Cuda::device_count());
        Ok(Device::Cuda(0))
    } else if allow_cpu {
        log::warn!("⚠️ CUDA not available, running on CPU");
        Ok(Device::Cpu)
    } else {
        Err(PipelineError::AcceleratorUnavailable)
    }
}

/// What the resample gate did for an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleOutcome {
    /// The marker was already present
    Skipped { total: usize },
    Resampled { total: usize },
}

impl ResampleOutcome {
    pub fn total(&self) -> usize {
        match *self {
            ResampleOutcome::Skipped { total } | ResampleOutcome::Resampled { total } => total,
        }
    }
}

#[derive(Debug)]
pub struct IterationReport {
    pub iteration: u32,
    pub resample: ResampleOutcome,
    pub window: RangeInclusive<u32>,
    pub window_samples: usize,
    pub training: TrainReport,
    /// `cv` of the checkpoint that was trained
    pub value_weight: f64,
    pub checkpoint: PathBuf,
}

pub struct Pipeline {
    config: PipelineConfig,
    device: Device,
    store: ShardStore,
    checkpoints: CheckpointManager,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let store = ShardStore::new(config.train_batch_size)
            .expecting(SampleShape::from_args(&config.net));
        let checkpoints = CheckpointManager::new(&config, device);
        Ok(Self {
            config,
            device,
            store,
            checkpoints,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Shard store that only accepts samples `args` can consume.
    fn store_for(&self, args: &NetArgs) -> ShardStore {
        self.store.clone().expecting(SampleShape::from_args(args))
    }

    /// Random stream for resampling and shuffling, fixed when the config has a seed.
    pub fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        }
    }

    /// Write a freshly initialised checkpoint for `iteration`. Datasets are not touched.
    pub fn create_new(&self, iteration: u32) -> Result<PathBuf> {
        let state = TrainingState::new(
            self.config.net.clone(),
            self.config.optimizer,
            self.config.warmup,
            self.device,
        );
        log::info!("🧠 Created new {} model\n{}", self.config.game_name, state.summary());
        self.checkpoints.save(&state, iteration)
    }

    /// Resample iteration `iteration` exactly once.
    ///
    /// The first call moves the self-play output to `{iter}_raw` and writes the
    /// resampled canonical dataset with its marker. Later calls see the marker and
    /// do nothing. A `_raw` folder without a canonical marker means an earlier run
    /// died mid-way: the partial canonical output is discarded and resampling
    /// starts over from `_raw`.
    pub fn ensure_resampled<M, R>(
        &self,
        model: &M,
        iteration: u32,
        rng: &mut R,
    ) -> Result<ResampleOutcome>
    where
        M: PolicyValueModel,
        R: Rng + ?Sized,
    {
        let canonical = self.config.iteration_dir(iteration);
        let raw = self.config.raw_iteration_dir(iteration);

        if let Some(total) = read_marker(&canonical)? {
            log::info!("Iteration {:04} already resampled ({} samples)", iteration, total);
            return Ok(ResampleOutcome::Skipped { total });
        }

        if raw.is_dir() {
            if canonical.exists() {
                log::warn!(
                    "⚠️ Found unfinished resample output in {}, starting over from {}",
                    canonical.display(),
                    raw.display()
                );
                fs::remove_dir_all(&canonical)?;
            }
        } else if canonical.is_dir() {
            fs::rename(&canonical, &raw)?;
        } else {
            return Err(PipelineError::DatasetMissing {
                iteration,
                folder: canonical,
            });
        }

        let total = resample_by_surprise(
            model,
            &self.store_for(model.args()),
            &raw,
            &canonical,
            model.args().cv,
            rng,
        )?;
        Ok(ResampleOutcome::Resampled { total })
    }

    /// Train checkpoint `iteration` on its replay window and save checkpoint `iteration + 1`.
    pub fn run_iteration<R: Rng>(&self, iteration: u32, rng: &mut R) -> Result<IterationReport> {
        log::info!("=== Iteration {:04} ({}) ===", iteration, self.config.game_name);

        let mut state = self.checkpoints.load(iteration)?;
        let resample = self.ensure_resampled(&state.model, iteration, rng)?;

        let args = state.model.args().clone();
        let window = assemble_window(&self.store_for(&args), &self.config, iteration)?;
        let steps = training_steps(
            window.len(),
            self.config.train_batch_size,
            self.config.train_sample_rate,
        );
        log::info!(
            "Window {}..={} holds {} samples, {} training steps",
            window.iterations.start(),
            window.iterations.end(),
            window.len(),
            steps
        );

        let mut trainer = ModelUpdateTrainer::new(
            args.cv,
            self.config.train_batch_size,
            self.device,
        );
        let training = trainer.train(
            &mut state.model,
            &mut state.optimizer,
            &mut state.scheduler,
            &window.samples,
            steps,
            rng,
        )?;

        let checkpoint = self.checkpoints.save(&state, iteration + 1)?;
        log::info!("✅ Iteration {:04} complete", iteration);

        Ok(IterationReport {
            iteration,
            resample,
            window_samples: window.len(),
            window: window.iterations,
            training,
            value_weight: args.cv,
            checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::resample::MARKER_FILE;
    use crate::test_support::{tiny_config, write_dataset};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn folder_state(folder: &Path) -> BTreeMap<String, (Vec<u8>, SystemTime)> {
        fs::read_dir(folder)
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let meta = entry.metadata().unwrap();
                (
                    entry.file_name().to_string_lossy().into_owned(),
                    (fs::read(entry.path()).unwrap(), meta.modified().unwrap()),
                )
            })
            .collect()
    }

    fn pipeline(dir: &Path) -> Pipeline {
        Pipeline::new(tiny_config(dir), Device::Cpu).unwrap()
    }

    #[test]
    fn create_new_writes_only_a_checkpoint() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let path = p.create_new(0).unwrap();
        assert!(path.is_file());
        assert!(p.checkpoints().inference_path(0).is_file());
        assert!(!p.config().dataset_dir().exists());
        assert_eq!(p.checkpoints().load(0).unwrap().scheduler.epoch(), 0);
    }

    #[test]
    fn resample_gate_runs_once() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let config = p.config().clone();
        write_dataset(p.store(), &config.iteration_dir(0), 40, &config.net);
        let state = TrainingState::new(config.net.clone(), config.optimizer, config.warmup, Device::Cpu);
        let mut rng = p.rng();

        let first = p.ensure_resampled(&state.model, 0, &mut rng).unwrap();
        assert_matches!(first, ResampleOutcome::Resampled { .. });
        assert!(config.raw_iteration_dir(0).is_dir());
        assert_eq!(read_marker(&config.iteration_dir(0)).unwrap(), Some(first.total()));

        let before = folder_state(&config.iteration_dir(0));
        let second = p.ensure_resampled(&state.model, 0, &mut rng).unwrap();
        assert_eq!(second, ResampleOutcome::Skipped { total: first.total() });
        assert_eq!(folder_state(&config.iteration_dir(0)), before);
        assert_eq!(p.store().read(&config.raw_iteration_dir(0)).unwrap().total_samples(), 40);
    }

    #[test]
    fn unfinished_resample_starts_over_from_raw() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let config = p.config().clone();
        write_dataset(p.store(), &config.raw_iteration_dir(2), 20, &config.net);
        // leftover from a crashed run: shards but no marker
        write_dataset(p.store(), &config.iteration_dir(2), 100, &config.net);
        let state = TrainingState::new(config.net.clone(), config.optimizer, config.warmup, Device::Cpu);

        let outcome = p.ensure_resampled(&state.model, 2, &mut p.rng()).unwrap();
        assert_matches!(outcome, ResampleOutcome::Resampled { .. });
        let canonical = p.store().read(&config.iteration_dir(2)).unwrap();
        assert_eq!(canonical.total_samples(), outcome.total());
        assert!(fs::read_dir(config.iteration_dir(2))
            .unwrap()
            .any(|e| e.unwrap().file_name() == MARKER_FILE));
    }

    #[test]
    fn samples_for_another_network_are_an_integrity_error() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let config = p.config().clone();
        let mut other = config.net.clone();
        other.v_size += 1;
        write_dataset(&ShardStore::new(16), &config.iteration_dir(0), 20, &other);
        p.create_new(0).unwrap();

        let result = p.run_iteration(0, &mut p.rng());
        assert_matches!(result, Err(PipelineError::DatasetIntegrity { .. }));
        assert!(!p.checkpoints().exists(1));
    }

    #[test]
    fn checkpoint_hyperparameters_drive_resampling() {
        let dir = tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.net.cv = 0.0;
        let trained = Pipeline::new(config.clone(), Device::Cpu).unwrap();
        trained.create_new(0).unwrap();

        // same run, launched with a different value-loss weight in the config
        config.net.cv = 4.0;
        let p = Pipeline::new(config.clone(), Device::Cpu).unwrap();
        let state = p.checkpoints().load(0).unwrap();
        assert_eq!(state.model.args().cv, 0.0);

        write_dataset(p.store(), &config.iteration_dir(0), 30, &config.net);
        let report = p.run_iteration(0, &mut p.rng()).unwrap();
        assert_eq!(report.value_weight, 0.0);
        assert_eq!(p.checkpoints().load(1).unwrap().model.args().cv, 0.0);
    }

    #[test]
    fn missing_dataset_is_reported() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        p.create_new(0).unwrap();
        let result = p.run_iteration(0, &mut p.rng());
        assert_matches!(result, Err(PipelineError::DatasetMissing { iteration: 0, .. }));
        assert!(!p.checkpoints().exists(1));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        assert_matches!(
            p.run_iteration(4, &mut p.rng()),
            Err(PipelineError::CheckpointNotFound(_))
        );
    }

    #[test]
    fn mismatched_triples_abort_without_checkpoint() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let config = p.config().clone();
        let canonical = config.iteration_dir(0);
        write_dataset(p.store(), &canonical, 40, &config.net);
        fs::write(canonical.join(MARKER_FILE), "total_out=40\n").unwrap();
        fs::remove_file(canonical.join("v_0001_16.pt")).unwrap();
        p.create_new(0).unwrap();

        let result = p.run_iteration(0, &mut p.rng());
        assert_matches!(result, Err(PipelineError::DatasetIntegrity { .. }));
        assert!(!p.checkpoints().exists(1));
    }

    #[test]
    fn two_iterations_end_to_end() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let config = p.config().clone();
        let mut rng = p.rng();
        p.create_new(0).unwrap();

        write_dataset(p.store(), &config.iteration_dir(0), 48, &config.net);
        let first = p.run_iteration(0, &mut rng).unwrap();
        assert_eq!(first.window, 0..=0);
        assert_eq!(
            first.training.steps,
            training_steps(first.window_samples, 16, 1.0)
        );
        assert!(p.checkpoints().exists(1));

        write_dataset(p.store(), &config.iteration_dir(1), 32, &config.net);
        let second = p.run_iteration(1, &mut rng).unwrap();
        assert_eq!(second.window, 0..=1);
        assert_eq!(
            second.window_samples,
            first.resample.total() + second.resample.total()
        );

        let state = p.checkpoints().load(2).unwrap();
        assert_eq!(state.scheduler.epoch(), 2);
    }
}
