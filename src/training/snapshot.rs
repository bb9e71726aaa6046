//! Parameter snapshots and their exponential merge.

use std::collections::BTreeMap;

use tch::{nn, Tensor};

use crate::{PipelineError, Result};

/// Weight of the incoming snapshot when folding it into the running merge.
pub const MERGE_WEIGHT: f64 = 0.25;

/// Immutable copy of every trainable parameter, ordered by name.
#[derive(Debug)]
pub struct ParamSnapshot {
    params: BTreeMap<String, Tensor>,
}

impl ParamSnapshot {
    /// Deep-copy the current trainable parameters of `vs`.
    pub fn capture(vs: &nn::VarStore) -> Self {
        let params = tch::no_grad(|| {
            vs.variables()
                .into_iter()
                .filter(|(_, t)| t.requires_grad())
                .map(|(name, t)| (name, t.detach().copy()))
                .collect()
        });
        Self { params }
    }

    pub fn from_map(params: BTreeMap<String, Tensor>) -> Self {
        Self { params }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn deep_copy(&self) -> Self {
        let params = tch::no_grad(|| {
            self.params
                .iter()
                .map(|(name, t)| (name.clone(), t.copy()))
                .collect()
        });
        Self { params }
    }

    /// Overwrite the matching variables of `vs` with this snapshot.
    pub fn apply_to(&self, vs: &mut nn::VarStore) -> Result<()> {
        let mut variables = vs.variables();
        for (name, value) in &self.params {
            let var = variables.get_mut(name).ok_or_else(|| {
                PipelineError::Configuration(format!("snapshot parameter '{}' not in model", name))
            })?;
            tch::no_grad(|| {
                var.copy_(value);
            });
        }
        Ok(())
    }
}

/// `running * (1 - weight) + next * weight`, per parameter.
///
/// Both snapshots must hold the same names and shapes.
pub fn blend(running: &ParamSnapshot, next: &ParamSnapshot, weight: f64) -> Result<ParamSnapshot> {
    if running.len() != next.len() {
        return Err(PipelineError::Configuration(format!(
            "cannot merge snapshots with {} and {} parameters",
            running.len(),
            next.len()
        )));
    }
    let mut params = BTreeMap::new();
    for (name, current) in &running.params {
        let incoming = next.get(name).ok_or_else(|| {
            PipelineError::Configuration(format!("parameter '{}' missing from snapshot", name))
        })?;
        if incoming.size() != current.size() {
            return Err(PipelineError::Configuration(format!(
                "parameter '{}' changed shape between snapshots",
                name
            )));
        }
        let merged = tch::no_grad(|| current * (1.0 - weight) + incoming * weight);
        params.insert(name.clone(), merged);
    }
    Ok(ParamSnapshot { params })
}

/// Fold snapshots left to right starting from the first one.
pub fn merge_snapshots(snapshots: &[ParamSnapshot]) -> Result<ParamSnapshot> {
    let (first, rest) = snapshots
        .split_first()
        .ok_or_else(|| PipelineError::Configuration("no snapshots to merge".to_string()))?;
    rest.iter()
        .try_fold(first.deep_copy(), |running, next| blend(&running, next, MERGE_WEIGHT))
}
