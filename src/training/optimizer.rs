//! SGD with momentum and a lambda learning-rate schedule.
//!
//! Both keep their state in plain values so it can be written into a checkpoint
//! and restored exactly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

use crate::config::{SgdConfig, WarmupSchedule};
use crate::{PipelineError, Result};

/// SGD with momentum and L2 weight decay (PyTorch semantics, no dampening).
///
/// ```text
/// d = grad + weight_decay * param
/// buf = d                      (first step)
/// buf = momentum * buf + d     (afterwards)
/// param -= lr * buf
/// ```
pub struct Sgd {
    config: SgdConfig,
    lr: f64,
    params: BTreeMap<String, Tensor>,
    momentum: BTreeMap<String, Tensor>,
}

impl Sgd {
    /// Track every trainable variable of `vs`.
    pub fn new(vs: &nn::VarStore, config: SgdConfig, lr: f64) -> Self {
        let params = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        Self {
            config,
            lr,
            params,
            momentum: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn zero_grad(&mut self) {
        for param in self.params.values_mut() {
            param.zero_grad();
        }
    }

    pub fn step(&mut self) {
        let SgdConfig {
            momentum,
            weight_decay,
        } = self.config;
        let lr = self.lr;

        tch::no_grad(|| {
            for (name, param) in self.params.iter_mut() {
                let grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let mut d_p = grad;
                if weight_decay != 0.0 {
                    d_p = d_p + &*param * weight_decay;
                }
                if momentum != 0.0 {
                    let buf = match self.momentum.remove(name) {
                        Some(buf) => buf * momentum + &d_p,
                        None => d_p.copy(),
                    };
                    d_p = buf.shallow_clone();
                    self.momentum.insert(name.clone(), buf);
                }
                let _ = param.g_sub_(&(d_p * lr));
            }
        });
    }

    /// Momentum buffers keyed by parameter name.
    pub fn state(&self) -> &BTreeMap<String, Tensor> {
        &self.momentum
    }

    /// Restore momentum buffers.
    ///
    /// Every buffer must belong to a tracked parameter and match its shape. On
    /// error the current buffers are left as they were.
    pub fn load_state(&mut self, buffers: BTreeMap<String, Tensor>) -> Result<()> {
        for (name, buffer) in &buffers {
            let param = self.params.get(name).ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "momentum buffer '{}' has no matching parameter",
                    name
                ))
            })?;
            if buffer.size() != param.size() {
                return Err(PipelineError::Configuration(format!(
                    "momentum buffer '{}' has shape {:?}, parameter has {:?}",
                    name,
                    buffer.size(),
                    param.size()
                )));
            }
        }
        self.momentum = buffers;
        Ok(())
    }

    pub fn param_names(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }
}

/// Serializable schedule state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f64,
    pub last_epoch: u64,
}

/// `lr = base_lr * factor(epoch)` where the factor is the warm-up value for the
/// first `warmup.epochs` epochs and 1 afterwards. One epoch is one model update.
#[derive(Debug, Clone)]
pub struct LambdaScheduler {
    warmup: WarmupSchedule,
    state: SchedulerState,
}

impl LambdaScheduler {
    pub fn new(base_lr: f64, warmup: WarmupSchedule) -> Self {
        Self {
            warmup,
            state: SchedulerState {
                base_lr,
                last_epoch: 0,
            },
        }
    }

    pub fn from_state(state: SchedulerState, warmup: WarmupSchedule) -> Self {
        Self { warmup, state }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn warmup(&self) -> WarmupSchedule {
        self.warmup
    }

    pub fn epoch(&self) -> u64 {
        self.state.last_epoch
    }

    pub fn factor(&self, epoch: u64) -> f64 {
        if epoch < self.warmup.epochs {
            self.warmup.factor
        } else {
            1.0
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.state.base_lr * self.factor(self.state.last_epoch)
    }

    /// Push the current rate into the optimizer.
    pub fn apply(&self, optimizer: &mut Sgd) {
        optimizer.set_lr(self.current_lr());
    }

    /// Advance one epoch and update the optimizer's rate.
    pub fn step(&mut self, optimizer: &mut Sgd) {
        self.state.last_epoch += 1;
        self.apply(optimizer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn single_param_store(value: f64) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[1], nn::Init::Const(value));
        vs
    }

    fn backward_identity(vs: &nn::VarStore) {
        // d(w)/dw = 1
        let vars = vs.variables();
        vars["w"].sum(Kind::Float).backward();
    }

    #[test]
    fn plain_sgd_step() {
        let vs = single_param_store(1.0);
        let mut opt = Sgd::new(
            &vs,
            SgdConfig {
                momentum: 0.0,
                weight_decay: 0.0,
            },
            0.1,
        );
        opt.zero_grad();
        backward_identity(&vs);
        opt.step();
        let w = vs.variables()["w"].double_value(&[0]);
        assert!((w - 0.9).abs() < 1e-6);
        assert!(opt.state().is_empty());
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let vs = single_param_store(1.0);
        let mut opt = Sgd::new(
            &vs,
            SgdConfig {
                momentum: 0.9,
                weight_decay: 0.0,
            },
            0.1,
        );
        for _ in 0..2 {
            opt.zero_grad();
            backward_identity(&vs);
            opt.step();
        }
        // 1 - 0.1 * 1 - 0.1 * (0.9 + 1)
        let w = vs.variables()["w"].double_value(&[0]);
        assert!((w - 0.71).abs() < 1e-6);
        assert!((opt.state()["w"].double_value(&[0]) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_adds_to_gradient() {
        let vs = single_param_store(2.0);
        let mut opt = Sgd::new(
            &vs,
            SgdConfig {
                momentum: 0.0,
                weight_decay: 0.5,
            },
            0.1,
        );
        opt.zero_grad();
        backward_identity(&vs);
        opt.step();
        // 2 - 0.1 * (1 + 0.5 * 2)
        let w = vs.variables()["w"].double_value(&[0]);
        assert!((w - 1.8).abs() < 1e-6);
    }

    #[test]
    fn momentum_buffers_must_match_parameters() {
        let vs = single_param_store(1.0);
        let mut opt = Sgd::new(&vs, SgdConfig::default(), 0.1);

        let mut good = BTreeMap::new();
        good.insert("w".to_string(), Tensor::from_slice(&[0.5f32]));
        opt.load_state(good).unwrap();
        assert!((opt.state()["w"].double_value(&[0]) - 0.5).abs() < 1e-6);

        let mut stranger = BTreeMap::new();
        stranger.insert("bias".to_string(), Tensor::from_slice(&[0.5f32]));
        assert!(matches!(
            opt.load_state(stranger),
            Err(PipelineError::Configuration(_))
        ));

        let mut reshaped = BTreeMap::new();
        reshaped.insert("w".to_string(), Tensor::from_slice(&[0.5f32, 0.5]));
        assert!(matches!(
            opt.load_state(reshaped),
            Err(PipelineError::Configuration(_))
        ));
        // rejected loads leave the previous buffers in place
        assert_eq!(opt.state()["w"].size(), vec![1]);
    }

    #[test]
    fn warmup_then_full_rate() {
        let vs = single_param_store(0.0);
        let mut opt = Sgd::new(&vs, SgdConfig::default(), 0.0);
        let mut scheduler = LambdaScheduler::new(0.003, WarmupSchedule::default());
        scheduler.apply(&mut opt);
        assert!((opt.lr() - 0.001).abs() < 1e-12);

        for _ in 0..9 {
            scheduler.step(&mut opt);
        }
        assert_eq!(scheduler.epoch(), 9);
        assert!((opt.lr() - 0.001).abs() < 1e-12);

        scheduler.step(&mut opt);
        assert_eq!(scheduler.epoch(), 10);
        assert!((opt.lr() - 0.003).abs() < 1e-12);
    }

    #[test]
    fn scheduler_state_round_trips_through_json() {
        let mut scheduler = LambdaScheduler::new(0.01, WarmupSchedule::default());
        let vs = single_param_store(0.0);
        let mut opt = Sgd::new(&vs, SgdConfig::default(), 0.0);
        scheduler.step(&mut opt);
        let json = serde_json::to_string(&scheduler.state()).unwrap();
        let restored: SchedulerState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, scheduler.state());
    }
}
