//! Pipeline configuration
//!
//! All tunables live in one immutable [`PipelineConfig`] built once at start-up
//! (from a game preset, optionally overridden by a JSON file) and passed by
//! reference to every component.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{PipelineError, Result};

/// Parameters of the replay-window growth curve.
///
/// `hist_size(i) = floor(scalar * (1 + beta * (((i + 1) / scalar)^alpha - 1) / alpha)) - lag_adjustment`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowCurve {
    /// How fast the curve flattens towards its plateau
    pub alpha: f64,
    /// Rough overall slope
    pub beta: f64,
    /// Approximately the first iteration where history stops growing linearly
    pub scalar: f64,
    /// Subtracted from the curve to compensate for client/server lag
    pub lag_adjustment: u32,
}

/// Hyperparameters needed to rebuild the network. Stored inside every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetArgs {
    /// Context tensor shape (channels, height, width)
    pub input_shape: (i64, i64, i64),
    /// Number of value outcome classes
    pub v_size: i64,
    /// Number of policy move indices
    pub pi_size: i64,
    /// Channels of the residual tower
    pub num_channels: i64,
    /// Number of residual blocks
    pub depth: usize,
    /// Base learning rate
    pub lr: f64,
    /// Coefficient of the value loss
    pub cv: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            weight_decay: 1e-3,
        }
    }
}

/// Learning-rate warm-up: `factor` for the first `epochs` scheduler epochs, 1 afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupSchedule {
    pub epochs: u64,
    pub factor: f64,
}

impl Default for WarmupSchedule {
    fn default() -> Self {
        Self {
            epochs: 10,
            factor: 1.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub game_name: String,
    /// Root holding `checkpoint/` and `dataset/`
    pub data_dir: PathBuf,
    pub train_batch_size: usize,
    /// Fraction of the window visited per iteration
    pub train_sample_rate: f64,
    pub window: WindowCurve,
    pub net: NetArgs,
    #[serde(default)]
    pub optimizer: SgdConfig,
    #[serde(default)]
    pub warmup: WarmupSchedule,
    /// Fixed seed for the resampling and shuffling streams
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Known game presets.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePreset {
    Connect4,
    Shadow,
}

impl PipelineConfig {
    pub fn preset(game: GamePreset, data_dir: impl Into<PathBuf>) -> Self {
        match game {
            GamePreset::Connect4 => Self::connect4(data_dir),
            GamePreset::Shadow => Self::shadow(data_dir),
        }
    }

    pub fn connect4(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            game_name: "connect4".to_string(),
            data_dir: data_dir.into(),
            train_batch_size: 1024,
            train_sample_rate: 1.0,
            window: WindowCurve {
                alpha: 0.5,
                beta: 0.5,
                scalar: 5.0,
                lag_adjustment: 1,
            },
            net: NetArgs {
                input_shape: (5, 6, 10),
                v_size: 3,
                pi_size: 25,
                num_channels: 32,
                depth: 8,
                lr: 0.001,
                cv: 1.7,
            },
            optimizer: SgdConfig::default(),
            warmup: WarmupSchedule::default(),
            seed: None,
        }
    }

    pub fn shadow(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            game_name: "shadow".to_string(),
            data_dir: data_dir.into(),
            train_batch_size: 1024,
            train_sample_rate: 1.0,
            window: WindowCurve {
                alpha: 0.5,
                beta: 0.6,
                scalar: 5.0,
                lag_adjustment: 0,
            },
            net: NetArgs {
                input_shape: (25, 4, 4),
                v_size: 2,
                pi_size: 1024,
                num_channels: 32,
                depth: 8,
                lr: 0.001,
                cv: 1.8,
            },
            optimizer: SgdConfig::default(),
            warmup: WarmupSchedule::default(),
            seed: None,
        }
    }

    /// Load a full configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot open {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(PipelineError::Configuration(msg.to_string()));

        if self.game_name.is_empty() {
            return fail("game_name must not be empty");
        }
        if self.train_batch_size == 0 {
            return fail("train_batch_size must be positive");
        }
        if !(self.train_sample_rate > 0.0) {
            return fail("train_sample_rate must be positive");
        }
        let w = &self.window;
        if !(w.alpha > 0.0 && w.beta > 0.0 && w.scalar > 0.0) {
            return fail("window alpha, beta and scalar must be positive");
        }
        let n = &self.net;
        let (c, h, wd) = n.input_shape;
        if c <= 0 || h <= 0 || wd <= 0 || n.v_size <= 0 || n.pi_size <= 0 || n.num_channels <= 0 {
            return fail("network shapes must be positive");
        }
        if !(n.lr > 0.0) {
            return fail("learning rate must be positive");
        }
        if !n.cv.is_finite() {
            return fail("value loss coefficient must be finite");
        }
        if !(self.warmup.factor > 0.0) {
            return fail("warm-up factor must be positive");
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoint")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }

    /// Canonical (post-resample) folder of an iteration.
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dataset_dir().join(format!("{:04}", iteration))
    }

    /// Raw self-play folder of an iteration, populated by the resample gate.
    pub fn raw_iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dataset_dir().join(format!("{:04}_raw", iteration))
    }

    pub fn checkpoint_path(&self, iteration: u32) -> PathBuf {
        self.checkpoint_dir()
            .join(format!("{:04}-{}.safetensors", iteration, self.game_name))
    }

    pub fn inference_path(&self, iteration: u32) -> PathBuf {
        self.checkpoint_dir()
            .join(format!("{:04}-{}_inference.safetensors", iteration, self.game_name))
    }
}
