//! Versioned checkpoints and inference artifacts.
//!
//! ```text
//! checkpoint/{iter:04}-{game}.safetensors            model.*, optim.momentum.*
//! checkpoint/{iter:04}-{game}_inference.safetensors  frozen weights only
//! ```
//!
//! Both files are written through a temporary sibling and renamed into place, so
//! a checkpoint is either complete or absent. Existing checkpoints are never
//! modified; the next iteration writes a new file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tch::{Device, Tensor};

use crate::config::{NetArgs, PipelineConfig, SgdConfig, WarmupSchedule};
use crate::neural::model_io::{
    load_into_varstore, read_tensor_file, varstore_tensors, write_tensor_file, TensorFile,
};
use crate::neural::policy_value_net::{ConvTowerNet, PolicyValueModel};
use crate::training::optimizer::{LambdaScheduler, SchedulerState, Sgd};
use crate::{PipelineError, Result};

pub const FORMAT_VERSION: &str = "1";

const MODEL_PREFIX: &str = "model.";
const MOMENTUM_PREFIX: &str = "optim.momentum.";

/// Everything needed to resume training: model, optimizer and schedule.
pub struct TrainingState {
    pub model: ConvTowerNet,
    pub optimizer: Sgd,
    pub scheduler: LambdaScheduler,
}

impl TrainingState {
    /// Fresh model with the optimizer rate set by the schedule's first epoch.
    pub fn new(args: NetArgs, sgd: SgdConfig, warmup: WarmupSchedule, device: Device) -> Self {
        let lr = args.lr;
        let model = ConvTowerNet::new(args, device);
        let mut optimizer = Sgd::new(model.var_store(), sgd, lr);
        let scheduler = LambdaScheduler::new(lr, warmup);
        scheduler.apply(&mut optimizer);
        Self {
            model,
            optimizer,
            scheduler,
        }
    }

    pub fn summary(&self) -> CheckpointSummary {
        let vs = self.model.var_store();
        CheckpointSummary {
            input_shape: self.model.args().input_shape,
            device: format!("{:?}", vs.device()),
            tensors: vs.variables().len(),
            parameters: vs
                .trainable_variables()
                .iter()
                .map(|t| t.numel())
                .sum(),
            epoch: self.scheduler.epoch(),
            learning_rate: self.optimizer.lr(),
        }
    }
}

/// Summary information about a training state
#[derive(Debug)]
pub struct CheckpointSummary {
    pub input_shape: (i64, i64, i64),
    pub device: String,
    pub tensors: usize,
    pub parameters: usize,
    pub epoch: u64,
    pub learning_rate: f64,
}

impl std::fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Model Summary:\n\
             📐 Input Shape: {:?}\n\
             💻 Device: {}\n\
             🔢 Tensors: {}, Parameters: {}\n\
             📈 Scheduler Epoch: {}, LR: {:.2e}",
            self.input_shape,
            self.device,
            self.tensors,
            self.parameters,
            self.epoch,
            self.learning_rate
        )
    }
}

/// Reads and writes iteration-indexed checkpoints under `checkpoint/`.
pub struct CheckpointManager {
    config: PipelineConfig,
    device: Device,
}

impl CheckpointManager {
    pub fn new(config: &PipelineConfig, device: Device) -> Self {
        Self {
            config: config.clone(),
            device,
        }
    }

    pub fn checkpoint_path(&self, iteration: u32) -> PathBuf {
        self.config.checkpoint_path(iteration)
    }

    pub fn inference_path(&self, iteration: u32) -> PathBuf {
        self.config.inference_path(iteration)
    }

    pub fn exists(&self, iteration: u32) -> bool {
        self.checkpoint_path(iteration).is_file()
    }

    /// Persist `state` as checkpoint `iteration` together with its inference artifact.
    pub fn save(&self, state: &TrainingState, iteration: u32) -> Result<PathBuf> {
        let path = self.checkpoint_path(iteration);
        let args = state.model.args();

        let mut tensors = varstore_tensors(state.model.var_store(), MODEL_PREFIX);
        for (name, buffer) in state.optimizer.state() {
            tensors.insert(format!("{}{}", MOMENTUM_PREFIX, name), buffer.shallow_clone());
        }

        let mut metadata = HashMap::new();
        metadata.insert("format_version".to_string(), FORMAT_VERSION.to_string());
        metadata.insert("iteration".to_string(), iteration.to_string());
        metadata.insert("game".to_string(), self.config.game_name.clone());
        metadata.insert("hyperparams".to_string(), serde_json::to_string(args)?);
        metadata.insert(
            "scheduler".to_string(),
            serde_json::to_string(&state.scheduler.state())?,
        );
        metadata.insert(
            "optimizer".to_string(),
            serde_json::to_string(state.optimizer.config())?,
        );
        metadata.insert(
            "warmup".to_string(),
            serde_json::to_string(&state.scheduler.warmup())?,
        );

        // The checkpoint goes last: its presence implies a complete inference artifact.
        let inference = self.inference_path(iteration);
        write_tensor_file(
            &inference,
            &varstore_tensors(state.model.var_store(), ""),
            inference_metadata(args)?,
        )?;
        write_tensor_file(&path, &tensors, metadata)?;

        log::info!(
            "💾 Saved checkpoint {:04} to {} (+ {})",
            iteration,
            path.display(),
            inference.display()
        );
        Ok(path)
    }

    /// Rebuild the full training state of checkpoint `iteration`.
    pub fn load(&self, iteration: u32) -> Result<TrainingState> {
        let path = self.checkpoint_path(iteration);
        if !path.is_file() {
            return Err(PipelineError::CheckpointNotFound(path));
        }
        let file = read_tensor_file(&path, self.device)?;

        let version = file.meta(&path, "format_version")?;
        if version != FORMAT_VERSION {
            return Err(PipelineError::corrupt(
                &path,
                format!("unsupported format version {}", version),
            ));
        }
        let args: NetArgs = parse_meta(&file, &path, "hyperparams")?;
        let sgd: SgdConfig = parse_meta(&file, &path, "optimizer")?;
        let schedule: SchedulerState = parse_meta(&file, &path, "scheduler")?;
        let warmup: WarmupSchedule = if file.metadata.contains_key("warmup") {
            parse_meta(&file, &path, "warmup")?
        } else {
            self.config.warmup
        };

        let mut state = TrainingState::new(args, sgd, warmup, self.device);
        load_into_varstore(state.model.var_store_mut(), &file.tensors, MODEL_PREFIX, &path)?;

        let momentum: BTreeMap<String, Tensor> = file
            .tensors
            .iter()
            .filter_map(|(key, tensor)| {
                key.strip_prefix(MOMENTUM_PREFIX)
                    .map(|name| (name.to_string(), tensor.shallow_clone()))
            })
            .collect();
        state
            .optimizer
            .load_state(momentum)
            .map_err(|e| PipelineError::corrupt(&path, e.to_string()))?;
        state.scheduler = LambdaScheduler::from_state(schedule, warmup);
        state.scheduler.apply(&mut state.optimizer);

        log::info!(
            "📂 Loaded checkpoint {:04} from {} (epoch {}, lr {:.2e})",
            iteration,
            path.display(),
            state.scheduler.epoch(),
            state.optimizer.lr()
        );
        Ok(state)
    }
}

fn inference_metadata(args: &NetArgs) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert("format_version".to_string(), FORMAT_VERSION.to_string());
    metadata.insert("hyperparams".to_string(), serde_json::to_string(args)?);
    metadata.insert(
        "input_shape".to_string(),
        serde_json::to_string(&args.input_shape)?,
    );
    metadata.insert("batch_axis".to_string(), "dynamic".to_string());
    metadata.insert(
        "outputs".to_string(),
        "exp(value_log_probs),exp(policy_log_probs)".to_string(),
    );
    Ok(metadata)
}

fn parse_meta<T: DeserializeOwned>(file: &TensorFile, path: &Path, key: &str) -> Result<T> {
    let raw = file.meta(path, key)?;
    serde_json::from_str(raw)
        .map_err(|e| PipelineError::corrupt(path, format!("bad '{}' metadata: {}", key, e)))
}

/// Frozen network loaded from an inference artifact.
///
/// Accepts any batch size and returns probabilities rather than log-probabilities.
pub struct InferenceModel {
    net: ConvTowerNet,
}

impl InferenceModel {
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::CheckpointNotFound(path.to_path_buf()));
        }
        let file = read_tensor_file(path, device)?;
        let args: NetArgs = parse_meta(&file, path, "hyperparams")?;
        let mut net = ConvTowerNet::new(args, device);
        load_into_varstore(net.var_store_mut(), &file.tensors, "", path)?;
        net.var_store_mut().freeze();
        Ok(Self { net })
    }

    pub fn args(&self) -> &NetArgs {
        self.net.args()
    }

    /// `(value_probs [N, V], policy_probs [N, PI])` for a context batch `[N, C, H, W]`.
    pub fn predict(&self, context: &Tensor) -> Result<(Tensor, Tensor)> {
        let (c, h, w) = self.net.args().input_shape;
        let size = context.size();
        if size.len() != 4 || size[1..] != [c, h, w] {
            return Err(PipelineError::Configuration(format!(
                "expected context of shape [N, {}, {}, {}], got {:?}",
                c, h, w, size
            )));
        }
        let input = context.to_device(self.net.device());
        let (v, pi) = tch::no_grad(|| self.net.forward_t(&input, false));
        Ok((v.exp(), pi.exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{random_samples, tiny_config};
    use crate::training::snapshot::ParamSnapshot;
    use assert_matches::assert_matches;
    use std::fs;
    use tch::Kind;
    use tempfile::tempdir;

    fn trained_state(config: &PipelineConfig) -> TrainingState {
        let mut state = TrainingState::new(
            config.net.clone(),
            config.optimizer,
            config.warmup,
            Device::Cpu,
        );
        let samples = random_samples(4, config.net.input_shape, config.net.v_size, config.net.pi_size);
        state.optimizer.zero_grad();
        let (v, pi) = state.model.forward_t(&samples.context, true);
        let loss = -(&samples.value * v).sum(Kind::Float) - (&samples.policy * pi).sum(Kind::Float);
        loss.backward();
        state.optimizer.step();
        state.scheduler.step(&mut state.optimizer);
        state
    }

    #[test]
    fn save_and_load_restore_everything() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path());
        let manager = CheckpointManager::new(&config, Device::Cpu);
        let state = trained_state(&config);

        let path = manager.save(&state, 3).unwrap();
        assert_eq!(path, dir.path().join("checkpoint").join("0003-tiny.safetensors"));
        assert!(manager.exists(3));
        assert!(manager.inference_path(3).is_file());

        let loaded = manager.load(3).unwrap();
        assert_eq!(loaded.model.args(), state.model.args());
        assert_eq!(loaded.scheduler.state(), state.scheduler.state());
        assert!((loaded.optimizer.lr() - state.optimizer.lr()).abs() < 1e-12);

        let before = ParamSnapshot::capture(state.model.var_store());
        let after = ParamSnapshot::capture(loaded.model.var_store());
        for name in before.names() {
            assert!(before.get(name).unwrap().equal(after.get(name).unwrap()));
        }

        assert!(!state.optimizer.state().is_empty());
        assert_eq!(loaded.optimizer.state().len(), state.optimizer.state().len());
        for (name, buffer) in state.optimizer.state() {
            assert!(buffer.equal(&loaded.optimizer.state()[name]));
        }
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(&tiny_config(dir.path()), Device::Cpu);
        assert!(!manager.exists(0));
        assert!(matches!(manager.load(0), Err(PipelineError::CheckpointNotFound(_))));
    }

    #[test]
    fn truncated_checkpoint_is_corrupt() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path());
        let manager = CheckpointManager::new(&config, Device::Cpu);
        manager.save(&trained_state(&config), 1).unwrap();

        let path = manager.checkpoint_path(1);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            manager.load(1),
            Err(PipelineError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn failed_inference_write_leaves_no_checkpoint() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path());
        let manager = CheckpointManager::new(&config, Device::Cpu);
        // a directory in the way makes the inference rename fail
        fs::create_dir_all(manager.inference_path(2)).unwrap();

        assert!(manager.save(&trained_state(&config), 2).is_err());
        assert!(!manager.exists(2));
    }

    #[test]
    fn momentum_of_another_shape_is_corrupt() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path());
        let manager = CheckpointManager::new(&config, Device::Cpu);
        manager.save(&trained_state(&config), 1).unwrap();

        let path = manager.checkpoint_path(1);
        let file = read_tensor_file(&path, Device::Cpu).unwrap();
        let mut tensors: BTreeMap<String, Tensor> = file
            .tensors
            .iter()
            .map(|(k, t)| (k.clone(), t.shallow_clone()))
            .collect();
        let key = tensors
            .keys()
            .find(|k| k.starts_with(MOMENTUM_PREFIX))
            .cloned()
            .unwrap();
        tensors.insert(key, Tensor::zeros([1], (Kind::Float, Device::Cpu)));
        write_tensor_file(&path, &tensors, file.metadata.clone()).unwrap();

        assert!(matches!(
            manager.load(1),
            Err(PipelineError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn warmup_travels_with_the_checkpoint() {
        let dir = tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.warmup = WarmupSchedule {
            epochs: 2,
            factor: 0.5,
        };
        CheckpointManager::new(&config, Device::Cpu)
            .save(&trained_state(&config), 0)
            .unwrap();

        let resumed = CheckpointManager::new(&tiny_config(dir.path()), Device::Cpu);
        let mut state = resumed.load(0).unwrap();
        assert_eq!(state.scheduler.warmup(), config.warmup);
        assert!((state.optimizer.lr() - config.net.lr * 0.5).abs() < 1e-12);

        state.scheduler.step(&mut state.optimizer);
        assert!((state.optimizer.lr() - config.net.lr).abs() < 1e-12);
    }

    #[test]
    fn inference_model_matches_training_model() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path());
        let manager = CheckpointManager::new(&config, Device::Cpu);
        let state = trained_state(&config);
        manager.save(&state, 0).unwrap();

        let inference = InferenceModel::load(&manager.inference_path(0), Device::Cpu).unwrap();
        for n in [1, 5] {
            let samples = random_samples(n, config.net.input_shape, config.net.v_size, config.net.pi_size);
            let (v, pi) = inference.predict(&samples.context).unwrap();
            let (ref_v, ref_pi) = state.model.forward_t(&samples.context, false);
            assert!(v.allclose(&ref_v.exp(), 1e-5, 1e-5, false));
            assert!(pi.allclose(&ref_pi.exp(), 1e-5, 1e-5, false));
            assert_eq!(pi.size(), vec![n as i64, config.net.pi_size]);
        }

        let wrong = Tensor::zeros([2, 1, 4, 4], (Kind::Float, Device::Cpu));
        assert_matches!(inference.predict(&wrong), Err(PipelineError::Configuration(_)));
    }

    #[test]
    fn summary_mentions_epoch() {
        let dir = tempdir().unwrap();
        let state = trained_state(&tiny_config(dir.path()));
        let display = format!("{}", state.summary());
        assert!(display.contains("Model Summary"));
        assert!(display.contains("Scheduler Epoch: 1"));
    }
}
