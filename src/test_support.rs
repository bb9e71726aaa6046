//! Small fixtures shared by the unit tests.

use std::path::Path;

use tch::{Device, Kind, Tensor};

use crate::config::{NetArgs, PipelineConfig};
use crate::data::shard_store::{SampleBatch, ShardStore};

/// A network small enough to train in milliseconds on the CPU.
pub fn tiny_args() -> NetArgs {
    NetArgs {
        input_shape: (3, 4, 4),
        v_size: 2,
        pi_size: 5,
        num_channels: 8,
        depth: 1,
        lr: 0.01,
        cv: 1.5,
    }
}

/// Shadow preset shrunk to [`tiny_args`], rooted at `data_dir`.
pub fn tiny_config(data_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::shadow(data_dir);
    config.game_name = "tiny".to_string();
    config.net = tiny_args();
    config.train_batch_size = 16;
    config.seed = Some(7);
    config
}

/// `n` random samples with softmax targets.
pub fn random_samples(n: usize, input_shape: (i64, i64, i64), v_size: i64, pi_size: i64) -> SampleBatch {
    let n = n as i64;
    let (c, h, w) = input_shape;
    let opts = (Kind::Float, Device::Cpu);
    SampleBatch::new(
        Tensor::rand([n, c, h, w], opts),
        Tensor::rand([n, v_size], opts).softmax(-1, Kind::Float),
        Tensor::rand([n, pi_size], opts).softmax(-1, Kind::Float),
    )
}

/// Write `n` random samples into `folder` as shards of `store`'s batch size.
pub fn write_dataset(store: &ShardStore, folder: &Path, n: usize, args: &NetArgs) -> usize {
    let samples = random_samples(n, args.input_shape, args.v_size, args.pi_size);
    let mut start = 0;
    let mut index = 0u32;
    while start < n {
        let len = store.batch_size().min(n - start);
        store
            .write(folder, &samples.narrow(start, len), index, true)
            .unwrap();
        start += len;
        index += 1;
    }
    n
}
