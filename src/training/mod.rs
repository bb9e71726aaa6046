pub mod losses;
pub mod optimizer;
pub mod snapshot;
pub mod trainer;

pub use optimizer::{LambdaScheduler, Sgd};
pub use snapshot::{merge_snapshots, ParamSnapshot};
pub use trainer::{training_steps, ModelUpdateTrainer};
