pub mod checkpoint;
pub mod model_io;
pub mod policy_value_net;
pub mod res_net_block;

// Re-export key components for convenience
pub use checkpoint::{CheckpointManager, InferenceModel, TrainingState};
pub use policy_value_net::{ConvTowerNet, PolicyValueModel};
