//! Density Regression Head
//!
//! Turns decoder tokens [N, P, C] into a density map [N, 16s, 16s] with s = sqrt(P):
//! - reshape the token sequence into a [N, C, s, s] grid (row-major patch order)
//! - stages 0..=2: conv3x3 -> GroupNorm(8) -> ReLU -> bilinear x2
//! - stage 3: conv3x3 -> GroupNorm(8) -> ReLU -> conv1x1 (256 -> 1) -> bilinear x2
//! - squeeze the channel dimension
//!
//! Weight paths: `decode_head{k}.0` (conv), `decode_head{k}.1` (norm),
//! `decode_head3.3` (output conv).

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

/// Channel width of every intermediate head stage
pub const HEAD_CHANNELS: usize = 256;

/// Group count of the head's group normalization
pub const HEAD_GROUPS: usize = 8;

const GROUP_NORM_EPS: f64 = 1e-5;

/// Side of the square grid holding `num_patches` tokens, if there is one
pub fn square_side(num_patches: usize) -> Option<usize> {
    let side = (num_patches as f64).sqrt().round() as usize;
    (side * side == num_patches).then_some(side)
}

/// Lay a token sequence [N, P, C] out as a feature map [N, C, s, s].
///
/// Token `i` lands at row `i / s`, column `i % s`.
pub fn tokens_to_grid(tokens: &Tensor) -> Result<Tensor> {
    let (n, p, c) = tokens.dims3()?;
    let Some(side) = square_side(p) else {
        candle_core::bail!("patch token count {p} is not a perfect square");
    };
    tokens.transpose(1, 2)?.reshape((n, c, side, side))
}

/// Linear interpolation between each element and its neighbours along `dim`,
/// producing the even/odd output samples of a 2x upsample with half-pixel
/// centers. Edges are clamped.
fn upsample_axis_2x(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let len = xs.dim(dim)?;
    let (prev, next) = if len == 1 {
        (xs.clone(), xs.clone())
    } else {
        let first = xs.narrow(dim, 0, 1)?;
        let last = xs.narrow(dim, len - 1, 1)?;
        let prev = Tensor::cat(&[&first, &xs.narrow(dim, 0, len - 1)?], dim)?;
        let next = Tensor::cat(&[&xs.narrow(dim, 1, len - 1)?, &last], dim)?;
        (prev, next)
    };
    let even = ((xs * 0.75)? + (prev * 0.25)?)?;
    let odd = ((xs * 0.75)? + (next * 0.25)?)?;

    let mut dims = xs.dims().to_vec();
    dims[dim] *= 2;
    Tensor::stack(&[even, odd], dim + 1)?.reshape(dims)
}

/// Bilinear x2 upsample of a [N, C, H, W] feature map, `align_corners=false`.
///
/// Built from differentiable tensor ops so gradients flow back into the head.
pub fn upsample_bilinear_2x(xs: &Tensor) -> Result<Tensor> {
    let _ = xs.dims4()?;
    let xs = upsample_axis_2x(xs, 3)?;
    upsample_axis_2x(&xs, 2)
}

/// conv3x3 -> GroupNorm -> ReLU
#[derive(Debug)]
struct ConvStage {
    conv: Conv2d,
    norm: GroupNorm,
}

impl ConvStage {
    fn load(vb: VarBuilder, in_channels: usize) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, HEAD_CHANNELS, 3, config, vb.pp("0"))?;
        let norm = group_norm(HEAD_GROUPS, HEAD_CHANNELS, GROUP_NORM_EPS, vb.pp("1"))?;
        Ok(Self { conv, norm })
    }
}

impl Module for ConvStage {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.norm.forward(&xs)?.relu()
    }
}

#[derive(Debug)]
pub struct DensityHead {
    stages: [ConvStage; 4],
    output_conv: Conv2d,
}

impl DensityHead {
    pub fn load(vb: VarBuilder, in_channels: usize) -> Result<Self> {
        let stages = [
            ConvStage::load(vb.pp("decode_head0"), in_channels)?,
            ConvStage::load(vb.pp("decode_head1"), HEAD_CHANNELS)?,
            ConvStage::load(vb.pp("decode_head2"), HEAD_CHANNELS)?,
            ConvStage::load(vb.pp("decode_head3"), HEAD_CHANNELS)?,
        ];
        let output_conv = conv2d(
            HEAD_CHANNELS,
            1,
            1,
            Conv2dConfig::default(),
            vb.pp("decode_head3.3"),
        )?;
        Ok(Self {
            stages,
            output_conv,
        })
    }

    /// # Arguments
    /// * `tokens` - Decoder output [N, P, C], P a perfect square
    ///
    /// # Returns
    /// Density map [N, 16·sqrt(P), 16·sqrt(P)]
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let mut xs = tokens_to_grid(tokens)?;
        for (i, stage) in self.stages.iter().enumerate() {
            xs = stage.forward(&xs)?;
            if i == 3 {
                xs = self.output_conv.forward(&xs)?;
            }
            xs = upsample_bilinear_2x(&xs)?;
        }
        xs.squeeze(1)
    }
}
