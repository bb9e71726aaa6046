pub mod resample;
pub mod shard_store;
pub mod window;

pub use resample::{read_marker, resample_by_surprise, MARKER_FILE};
pub use shard_store::{IterationDataset, SampleBatch, SampleShape, ShardStore, ShardWriter};
pub use window::{assemble_window, hist_size, window_range};
