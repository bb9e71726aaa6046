//! Sample shards on disk.
//!
//! A shard is three co-indexed tensor files sharing one `(batch_index, size)`
//! identity:
//!
//! ```text
//! c_{batch:04}_{size}.pt   context  [size, C, H, W]
//! v_{batch:04}_{size}.pt   value    [size, V]
//! p_{batch:04}_{size}.pt   policy   [size, PI]
//! ```
//!
//! Shard order is the numeric batch index parsed from the file name, never the
//! directory listing order.

use std::fs;
use std::path::{Path, PathBuf};

use glob::{glob, Pattern};
use tch::{Device, Tensor};

use crate::config::NetArgs;
use crate::{PipelineError, Result};

const CONTEXT_PREFIX: &str = "c";
const VALUE_PREFIX: &str = "v";
const POLICY_PREFIX: &str = "p";

/// A batch of samples held as three tensors sharing their first dimension.
#[derive(Debug)]
pub struct SampleBatch {
    pub context: Tensor,
    pub value: Tensor,
    pub policy: Tensor,
}

impl SampleBatch {
    pub fn new(context: Tensor, value: Tensor, policy: Tensor) -> Self {
        Self {
            context,
            value,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.context.size().first().copied().unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows `start..start + len` as a view sharing storage.
    pub fn narrow(&self, start: usize, len: usize) -> SampleBatch {
        SampleBatch {
            context: self.context.narrow(0, start as i64, len as i64),
            value: self.value.narrow(0, start as i64, len as i64),
            policy: self.policy.narrow(0, start as i64, len as i64),
        }
    }

    /// Gather arbitrary rows into a new batch.
    pub fn select(&self, rows: &[i64]) -> SampleBatch {
        let index = Tensor::from_slice(rows).to_device(self.context.device());
        SampleBatch {
            context: self.context.index_select(0, &index),
            value: self.value.index_select(0, &index),
            policy: self.policy.index_select(0, &index),
        }
    }

    pub fn to_device(&self, device: Device) -> SampleBatch {
        SampleBatch {
            context: self.context.to_device(device),
            value: self.value.to_device(device),
            policy: self.policy.to_device(device),
        }
    }

    /// Concatenate batches along the sample axis.
    pub fn cat(batches: &[SampleBatch]) -> SampleBatch {
        let context: Vec<&Tensor> = batches.iter().map(|b| &b.context).collect();
        let value: Vec<&Tensor> = batches.iter().map(|b| &b.value).collect();
        let policy: Vec<&Tensor> = batches.iter().map(|b| &b.policy).collect();
        SampleBatch {
            context: Tensor::cat(&context, 0),
            value: Tensor::cat(&value, 0),
            policy: Tensor::cat(&policy, 0),
        }
    }

    /// Fail unless every tensor has the per-sample shape in `shape`.
    fn check_shape(&self, folder: &Path, shape: &SampleShape) -> Result<()> {
        let n = self.len() as i64;
        let (c, h, w) = shape.context;
        let expected = [
            ("context", &self.context, vec![n, c, h, w]),
            ("value", &self.value, vec![n, shape.value]),
            ("policy", &self.policy, vec![n, shape.policy]),
        ];
        for (label, tensor, dims) in expected {
            if tensor.size() != dims {
                return Err(PipelineError::integrity(
                    folder,
                    format!("{} tensor has shape {:?}, expected {:?}", label, tensor.size(), dims),
                ));
            }
        }
        Ok(())
    }

    fn check_consistent(&self, folder: &Path, expected: usize) -> Result<()> {
        let counts = [
            self.context.size().first().copied().unwrap_or(0),
            self.value.size().first().copied().unwrap_or(0),
            self.policy.size().first().copied().unwrap_or(0),
        ];
        if counts.iter().any(|&n| n as usize != expected) {
            return Err(PipelineError::integrity(
                folder,
                format!(
                    "shard sample counts c={} v={} p={} do not match expected {}",
                    counts[0], counts[1], counts[2], expected
                ),
            ));
        }
        Ok(())
    }
}

/// Per-sample tensor shapes a dataset must have to feed a given network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleShape {
    pub context: (i64, i64, i64),
    pub value: i64,
    pub policy: i64,
}

impl SampleShape {
    pub fn from_args(args: &NetArgs) -> Self {
        Self {
            context: args.input_shape,
            value: args.v_size,
            policy: args.pi_size,
        }
    }
}

/// Paths and identity of one persisted shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFiles {
    pub batch_index: u32,
    pub size: usize,
    pub context: PathBuf,
    pub value: PathBuf,
    pub policy: PathBuf,
}

impl ShardFiles {
    fn load(&self, folder: &Path, shape: Option<&SampleShape>) -> Result<SampleBatch> {
        let batch = SampleBatch::new(
            Tensor::load(&self.context)?,
            Tensor::load(&self.value)?,
            Tensor::load(&self.policy)?,
        );
        batch.check_consistent(folder, self.size)?;
        if let Some(shape) = shape {
            batch.check_shape(folder, shape)?;
        }
        Ok(batch)
    }
}

/// All shards of one iteration folder, validated but not loaded.
#[derive(Debug, Clone)]
pub struct IterationDataset {
    folder: PathBuf,
    shards: Vec<ShardFiles>,
    shape: Option<SampleShape>,
}

impl IterationDataset {
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn shard_files(&self) -> &[ShardFiles] {
        &self.shards
    }

    /// Sample count as declared by the shard names.
    pub fn total_samples(&self) -> usize {
        self.shards.iter().map(|s| s.size).sum()
    }

    /// Lazily load shards in batch-index order. Each call starts a fresh pass.
    pub fn shards(&self) -> impl Iterator<Item = Result<SampleBatch>> + '_ {
        self.shards
            .iter()
            .map(move |s| s.load(&self.folder, self.shape.as_ref()))
    }

    /// Load every shard and concatenate them.
    pub fn load_all(&self) -> Result<SampleBatch> {
        let batches = self.shards().collect::<Result<Vec<_>>>()?;
        Ok(SampleBatch::cat(&batches))
    }
}

/// Reads and writes shard triples with a fixed flush size.
///
/// A store built with [`ShardStore::expecting`] also rejects shards whose tensors
/// do not match the network's input and output shapes.
#[derive(Debug, Clone)]
pub struct ShardStore {
    batch_size: usize,
    shape: Option<SampleShape>,
}

impl ShardStore {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shape: None,
        }
    }

    pub fn expecting(mut self, shape: SampleShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn shape(&self) -> Option<&SampleShape> {
        self.shape.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Persist `samples` as shard `batch_index` when it is full, or when `force` is
    /// set and it is non-empty. Returns whether a shard was written.
    pub fn write(
        &self,
        folder: &Path,
        samples: &SampleBatch,
        batch_index: u32,
        force: bool,
    ) -> Result<bool> {
        let size = samples.len();
        if !(size >= self.batch_size || (force && size > 0)) {
            return Ok(false);
        }
        samples.check_consistent(folder, size)?;
        fs::create_dir_all(folder)?;

        let parts = [
            (CONTEXT_PREFIX, &samples.context),
            (VALUE_PREFIX, &samples.value),
            (POLICY_PREFIX, &samples.policy),
        ];
        for (prefix, tensor) in parts {
            let path = folder.join(shard_file_name(prefix, batch_index, size));
            let tmp = path.with_extension("pt.tmp");
            tensor.to_device(Device::Cpu).contiguous().save(&tmp)?;
            fs::rename(&tmp, &path)?;
        }
        log::debug!(
            "Wrote shard {} ({} samples) to {}",
            batch_index,
            size,
            folder.display()
        );
        Ok(true)
    }

    /// Discover and validate every shard triple in `folder`.
    pub fn read(&self, folder: &Path) -> Result<IterationDataset> {
        if !folder.is_dir() {
            return Err(PipelineError::integrity(folder, "dataset folder does not exist"));
        }
        let context = list_shards(folder, CONTEXT_PREFIX)?;
        let value = list_shards(folder, VALUE_PREFIX)?;
        let policy = list_shards(folder, POLICY_PREFIX)?;

        if context.is_empty() || value.is_empty() || policy.is_empty() {
            return Err(PipelineError::integrity(folder, "no training data found"));
        }
        if !(context.len() == value.len() && value.len() == policy.len()) {
            return Err(PipelineError::integrity(
                folder,
                format!(
                    "dataset size mismatch: {} context, {} value, {} policy shards",
                    context.len(),
                    value.len(),
                    policy.len()
                ),
            ));
        }

        let mut shards = Vec::with_capacity(context.len());
        for ((c, v), p) in context.into_iter().zip(value).zip(policy) {
            if (c.0, c.1) != (v.0, v.1) || (c.0, c.1) != (p.0, p.1) {
                return Err(PipelineError::integrity(
                    folder,
                    format!(
                        "shard triple mismatch: {} / {} / {}",
                        c.2.display(),
                        v.2.display(),
                        p.2.display()
                    ),
                ));
            }
            shards.push(ShardFiles {
                batch_index: c.0,
                size: c.1,
                context: c.2,
                value: v.2,
                policy: p.2,
            });
        }

        Ok(IterationDataset {
            folder: folder.to_path_buf(),
            shards,
            shape: self.shape,
        })
    }
}

/// Accumulates samples and flushes full shards through a [`ShardStore`].
pub struct ShardWriter<'a> {
    store: &'a ShardStore,
    folder: PathBuf,
    pending: Vec<SampleBatch>,
    pending_len: usize,
    batch_index: u32,
    written: usize,
}

impl<'a> ShardWriter<'a> {
    pub fn new(store: &'a ShardStore, folder: impl Into<PathBuf>) -> Self {
        Self {
            store,
            folder: folder.into(),
            pending: Vec::new(),
            pending_len: 0,
            batch_index: 0,
            written: 0,
        }
    }

    /// Queue `copies` copies of row `row` of `batch`.
    pub fn push_row(&mut self, batch: &SampleBatch, row: usize, copies: usize) -> Result<()> {
        for _ in 0..copies {
            self.pending.push(batch.narrow(row, 1));
            self.pending_len += 1;
            self.flush(false)?;
        }
        Ok(())
    }

    /// Number of shards written so far.
    pub fn shards_written(&self) -> u32 {
        self.batch_index
    }

    /// Samples persisted so far.
    pub fn samples_written(&self) -> usize {
        self.written
    }

    /// Force out the trailing partial shard and return the total sample count.
    pub fn finish(mut self) -> Result<usize> {
        self.flush(true)?;
        Ok(self.written)
    }

    fn flush(&mut self, force: bool) -> Result<()> {
        if self.pending_len == 0 || !(force || self.pending_len >= self.store.batch_size()) {
            return Ok(());
        }
        let samples = SampleBatch::cat(&self.pending);
        if self
            .store
            .write(&self.folder, &samples, self.batch_index, force)?
        {
            self.written += self.pending_len;
            self.pending.clear();
            self.pending_len = 0;
            self.batch_index += 1;
        }
        Ok(())
    }
}

pub fn shard_file_name(prefix: &str, batch_index: u32, size: usize) -> String {
    format!("{}_{:04}_{}.pt", prefix, batch_index, size)
}

/// Parse `{prefix}_{batch}_{size}.pt` into `(batch, size)`.
pub fn parse_shard_name(file_name: &str, prefix: &str) -> Option<(u32, usize)> {
    let stem = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".pt")?;
    let (batch, size) = stem.split_once('_')?;
    Some((batch.parse().ok()?, size.parse().ok()?))
}

fn list_shards(folder: &Path, prefix: &str) -> Result<Vec<(u32, usize, PathBuf)>> {
    let folder_str = folder.to_str().ok_or_else(|| {
        PipelineError::Configuration(format!("non UTF-8 dataset path: {}", folder.display()))
    })?;
    let pattern = Path::new(&Pattern::escape(folder_str)).join(format!("{}_*_*.pt", prefix));
    let entries = glob(&pattern.to_string_lossy())
        .map_err(|e| PipelineError::Configuration(format!("bad shard pattern: {}", e)))?;

    let mut shards = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::Io(e.into_error()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        match parse_shard_name(&name, prefix) {
            Some((batch, size)) => shards.push((batch, size, path)),
            None => {
                return Err(PipelineError::integrity(
                    folder,
                    format!("unrecognised shard file name {}", name),
                ))
            }
        }
    }
    shards.sort_by_key(|(batch, _, _)| *batch);
    Ok(shards)
}
