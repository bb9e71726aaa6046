//! # zero_trainer
//!
//! Training-data curation and model-update pipeline for an AlphaZero-style
//! self-play loop.
//!
//! ## Features
//!
//! - **Shard Store**: fixed-size `(context, value, policy)` sample shards on disk
//! - **Window Scheduler**: saturating growth curve for the replay window
//! - **Surprise Resampler**: loss-weighted stochastic-rounding resampling
//! - **Model Update Trainer**: SGD steps with exponential snapshot merging
//! - **Checkpoint Manager**: versioned, atomically written checkpoints
//!
//! ## Usage
//!
//! ```no_run
//! use zero_trainer::{config::PipelineConfig, pipeline::Pipeline};
//! use tch::Device;
//!
//! # fn main() -> zero_trainer::Result<()> {
//! let config = PipelineConfig::shadow("data");
//! let pipeline = Pipeline::new(config, Device::Cpu)?;
//! pipeline.create_new(0)?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

// ============================================================================
// PUBLIC API MODULES
// ============================================================================

/// Immutable pipeline configuration and game presets
pub mod config;

/// Shard storage, replay window and surprise resampling
pub mod data;

/// Policy/value model boundary and checkpoint persistence
pub mod neural;

/// Optimizer, schedule, snapshot merging and the update loop
pub mod training;

/// Per-iteration orchestration
pub mod pipeline;

/// Logger initialisation for the binaries
pub mod logging;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{NetArgs, PipelineConfig, WindowCurve};
pub use data::shard_store::{IterationDataset, SampleBatch, ShardStore};
pub use neural::checkpoint::{CheckpointManager, TrainingState};
pub use pipeline::Pipeline;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Main error type for the training pipeline.
///
/// Every variant is fatal: the pipeline performs no retries, the binary logs the
/// cause and exits with [`PipelineError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("CUDA is not available")]
    AcceleratorUnavailable,

    #[error("dataset folder does not exist for iteration {iteration}: {folder}")]
    DatasetMissing { iteration: u32, folder: PathBuf },

    #[error("dataset integrity error in {folder}: {reason}")]
    DatasetIntegrity { folder: PathBuf, reason: String },

    #[error("numeric instability: {0}")]
    NumericInstability(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl PipelineError {
    pub(crate) fn integrity(folder: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::DatasetIntegrity {
            folder: folder.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this failure. All failures are fatal.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
