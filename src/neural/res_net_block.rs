use tch::{nn, Tensor};

/// Largest group count in {16, 8, 4, 2, 1} that divides `channels`.
pub fn norm_groups(channels: i64) -> i64 {
    [16, 8, 4, 2]
        .into_iter()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

/// Residual block with GroupNorm (more stable than BatchNorm for gradients)
pub struct ResNetBlock {
    conv1: nn::Conv2D,
    gn1: nn::GroupNorm,
    conv2: nn::Conv2D,
    gn2: nn::GroupNorm,
    downsample: Option<nn::Conv2D>,
}

impl ResNetBlock {
    pub fn new(path: &nn::Path, channels_in: i64, channels_out: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            padding: 1,
            bias: false,
            ..Default::default()
        };
        let groups = norm_groups(channels_out);

        let conv1 = nn::conv2d(path / "conv1", channels_in, channels_out, 3, conv_cfg);
        let gn1 = nn::group_norm(path / "gn1", groups, channels_out, Default::default());
        let conv2 = nn::conv2d(path / "conv2", channels_out, channels_out, 3, conv_cfg);
        let gn2 = nn::group_norm(path / "gn2", groups, channels_out, Default::default());

        // 1x1 projection when the skip connection changes width
        let downsample = (channels_in != channels_out).then(|| {
            nn::conv2d(
                path / "downsample",
                channels_in,
                channels_out,
                1,
                Default::default(),
            )
        });

        Self {
            conv1,
            gn1,
            conv2,
            gn2,
            downsample,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let identity = match &self.downsample {
            Some(downsample) => x.apply(downsample),
            None => x.shallow_clone(),
        };

        let out = x.apply(&self.conv1).apply_t(&self.gn1, train).relu();
        let out = out.apply(&self.conv2).apply_t(&self.gn2, train);

        (out + identity).relu()
    }
}
