//! Model I/O utilities using safetensors format
//!
//! Checkpoints and inference artifacts are written as safetensors files rather
//! than libtorch's native pickle format, so they stay readable across libtorch
//! versions and can carry string metadata (hyperparameters, scheduler state).
//!
//! Files are written to a temporary sibling and renamed into place, so a reader
//! never observes a half-written file under the final name.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use safetensors::serialize_to_file;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tch::{nn, Device, Kind, Tensor};

use crate::{PipelineError, Result};

/// Tensors and string metadata read back from a safetensors file.
#[derive(Debug)]
pub struct TensorFile {
    pub tensors: HashMap<String, Tensor>,
    pub metadata: HashMap<String, String>,
}

impl TensorFile {
    pub fn meta(&self, path: &Path, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::corrupt(path, format!("missing metadata '{}'", key)))
    }
}

/// Named trainable and non-trainable variables of a VarStore, prefixed.
pub fn varstore_tensors(vs: &nn::VarStore, prefix: &str) -> BTreeMap<String, Tensor> {
    vs.variables()
        .into_iter()
        .map(|(name, tensor)| (format!("{}{}", prefix, name), tensor))
        .collect()
}

/// Copy `{prefix}{name}` tensors from `tensors` into every variable of `vs`.
///
/// Every variable must be present with the same shape.
pub fn load_into_varstore(
    vs: &mut nn::VarStore,
    tensors: &HashMap<String, Tensor>,
    prefix: &str,
    path: &Path,
) -> Result<()> {
    for (name, mut var) in vs.variables() {
        let key = format!("{}{}", prefix, name);
        let loaded = tensors
            .get(&key)
            .ok_or_else(|| PipelineError::corrupt(path, format!("missing tensor '{}'", key)))?;
        if loaded.size() != var.size() {
            return Err(PipelineError::corrupt(
                path,
                format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    key,
                    loaded.size(),
                    var.size()
                ),
            ));
        }
        tch::no_grad(|| {
            var.copy_(loaded);
        });
    }
    Ok(())
}

/// Serialize `tensors` with `metadata` to `path`, atomically.
pub fn write_tensor_file(
    path: &Path,
    tensors: &BTreeMap<String, Tensor>,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let mut encoded: Vec<(String, Vec<u8>, Dtype, Vec<usize>)> = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let shape: Vec<usize> = tensor.size().iter().map(|&x| x as usize).collect();
        let (data, dtype) = tensor_to_bytes(tensor)?;
        encoded.push((name.clone(), data, dtype, shape));
    }

    let views = encoded
        .iter()
        .map(|(name, data, dtype, shape)| {
            TensorView::new(*dtype, shape.clone(), data).map(|view| (name.clone(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    serialize_to_file(views, &Some(metadata), &tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read every tensor of a safetensors file onto `device`.
///
/// Any structural problem is reported as [`PipelineError::CheckpointCorrupt`].
pub fn read_tensor_file(path: &Path, device: Device) -> Result<TensorFile> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let corrupt = |e: safetensors::SafeTensorError| PipelineError::corrupt(path, e.to_string());
    let (_, header) = SafeTensors::read_metadata(&buffer).map_err(corrupt)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let parsed = SafeTensors::deserialize(&buffer).map_err(corrupt)?;

    let mut tensors = HashMap::new();
    for (name, view) in parsed.tensors() {
        let tensor = tensor_view_to_tensor(&view).map_err(|e| PipelineError::corrupt(path, e.to_string()))?;
        tensors.insert(name, tensor.to_device(device));
    }

    Ok(TensorFile { tensors, metadata })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<(Vec<u8>, Dtype)> {
    // Flatten the tensor for conversion, then get contiguous data on CPU
    let tensor = tensor
        .detach()
        .to_device(Device::Cpu)
        .flatten(0, -1)
        .contiguous();

    match tensor.kind() {
        Kind::Double => {
            let data = Vec::<f64>::try_from(&tensor)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F64))
        }
        Kind::Int => {
            let data = Vec::<i32>::try_from(&tensor)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::I32))
        }
        Kind::Int64 => {
            let data = Vec::<i64>::try_from(&tensor)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::I64))
        }
        // Half/BFloat16 are widened, restored as f32 on load
        Kind::Float | Kind::Half | Kind::BFloat16 => {
            let data = Vec::<f32>::try_from(&tensor.to_kind(Kind::Float))?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F32))
        }
        kind => Err(PipelineError::Configuration(format!(
            "unsupported tensor kind: {:?}",
            kind
        ))),
    }
}

fn tensor_view_to_tensor(view: &TensorView) -> std::result::Result<Tensor, String> {
    let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let data = view.data();

    let tensor = match view.dtype() {
        Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_slice(&floats)
        }
        Dtype::F64 => {
            let doubles: Vec<f64> = data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_slice(&doubles)
        }
        Dtype::I32 => {
            let ints: Vec<i32> = data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_slice(&ints)
        }
        Dtype::I64 => {
            let longs: Vec<i64> = data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_slice(&longs)
        }
        other => return Err(format!("unsupported dtype: {:?}", other)),
    };
    Ok(tensor.reshape(&shape))
}
