use tch::{nn, Device, Kind, Tensor};

use crate::config::NetArgs;
use crate::neural::res_net_block::{norm_groups, ResNetBlock};

const HEAD_CHANNELS: i64 = 32;
const VALUE_HIDDEN: i64 = 256;

/// The network as seen by the pipeline: an opaque differentiable function from a
/// context batch `[N, C, H, W]` to `(value_log_probs [N, V], policy_log_probs [N, PI])`.
///
/// Implementations must be deterministic for fixed weights and input when
/// `train` is false. Not Sync due to libtorch's raw pointer usage.
pub trait PolicyValueModel {
    fn forward_t(&self, input: &Tensor, train: bool) -> (Tensor, Tensor);

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Hyperparameters the model was built from.
    fn args(&self) -> &NetArgs;

    fn device(&self) -> Device {
        self.var_store().device()
    }
}

/// Reference residual tower used when bootstrapping a fresh model.
pub struct ConvTowerNet {
    args: NetArgs,
    vs: nn::VarStore,
    stem: nn::Conv2D,
    stem_gn: nn::GroupNorm,
    blocks: Vec<ResNetBlock>,
    v_conv: nn::Conv2D,
    v_gn: nn::GroupNorm,
    v_fc1: nn::Linear,
    v_fc2: nn::Linear,
    pi_conv: nn::Conv2D,
    pi_gn: nn::GroupNorm,
    pi_fc: nn::Linear,
}

impl ConvTowerNet {
    pub fn new(args: NetArgs, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let (channels, height, width) = args.input_shape;
        let width_ch = args.num_channels;
        let no_bias = nn::ConvConfig {
            bias: false,
            ..Default::default()
        };

        let stem = nn::conv2d(
            &root / "stem",
            channels,
            width_ch,
            3,
            nn::ConvConfig {
                padding: 1,
                bias: false,
                ..Default::default()
            },
        );
        let stem_gn = nn::group_norm(&root / "stem_gn", norm_groups(width_ch), width_ch, Default::default());

        let blocks = (0..args.depth)
            .map(|idx| ResNetBlock::new(&(&root / format!("block_{idx}")), width_ch, width_ch))
            .collect();

        let flat = HEAD_CHANNELS * height * width;
        let head_groups = norm_groups(HEAD_CHANNELS);

        let v_conv = nn::conv2d(&root / "v_conv", width_ch, HEAD_CHANNELS, 1, no_bias);
        let v_gn = nn::group_norm(&root / "v_gn", head_groups, HEAD_CHANNELS, Default::default());
        let v_fc1 = nn::linear(&root / "v_fc1", flat, VALUE_HIDDEN, Default::default());
        let v_fc2 = nn::linear(&root / "v_fc2", VALUE_HIDDEN, args.v_size, Default::default());

        let pi_conv = nn::conv2d(&root / "pi_conv", width_ch, HEAD_CHANNELS, 1, no_bias);
        let pi_gn = nn::group_norm(&root / "pi_gn", head_groups, HEAD_CHANNELS, Default::default());
        let pi_fc = nn::linear(&root / "pi_fc", flat, args.pi_size, Default::default());

        Self {
            args,
            vs,
            stem,
            stem_gn,
            blocks,
            v_conv,
            v_gn,
            v_fc1,
            v_fc2,
            pi_conv,
            pi_gn,
            pi_fc,
        }
    }
}

impl PolicyValueModel for ConvTowerNet {
    fn forward_t(&self, input: &Tensor, train: bool) -> (Tensor, Tensor) {
        let mut s = input
            .to_kind(Kind::Float)
            .apply(&self.stem)
            .apply_t(&self.stem_gn, train)
            .relu();
        for block in &self.blocks {
            s = block.forward(&s, train);
        }

        let v = s
            .apply(&self.v_conv)
            .apply_t(&self.v_gn, train)
            .relu()
            .flatten(1, -1)
            .apply(&self.v_fc1)
            .relu()
            .apply(&self.v_fc2)
            .log_softmax(-1, Kind::Float);

        let pi = s
            .apply(&self.pi_conv)
            .apply_t(&self.pi_gn, train)
            .relu()
            .flatten(1, -1)
            .apply(&self.pi_fc)
            .log_softmax(-1, Kind::Float);

        (v, pi)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn args(&self) -> &NetArgs {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tiny_args;

    #[test]
    fn test_forward_shapes_and_log_probs() {
        tch::manual_seed(1);
        let net = ConvTowerNet::new(tiny_args(), Device::Cpu);
        let input = Tensor::rand([6, 3, 4, 4], tch::kind::FLOAT_CPU);
        let (v, pi) = net.forward_t(&input, false);

        assert_eq!(v.size(), vec![6, 2]);
        assert_eq!(pi.size(), vec![6, 5]);

        let v_sum = v.exp().sum_dim_intlist([1].as_ref(), false, Kind::Float);
        let ones = Tensor::ones([6], tch::kind::FLOAT_CPU);
        assert!(v_sum.allclose(&ones, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_eval_forward_is_deterministic() {
        let net = ConvTowerNet::new(tiny_args(), Device::Cpu);
        let input = Tensor::rand([2, 3, 4, 4], tch::kind::FLOAT_CPU);
        let (v1, pi1) = net.forward_t(&input, false);
        let (v2, pi2) = net.forward_t(&input, false);
        assert!(v1.equal(&v2));
        assert!(pi1.equal(&pi2));
    }

    #[test]
    fn test_accepts_any_batch_size() {
        let net = ConvTowerNet::new(tiny_args(), Device::Cpu);
        for n in [1, 7] {
            let (v, _) = net.forward_t(&Tensor::zeros([n, 3, 4, 4], tch::kind::FLOAT_CPU), false);
            assert_eq!(v.size()[0], n);
        }
    }
}
