use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::CounterConfig;
use crate::model::attention::CrossAttentionBlock;
use crate::model::norm::LayerNorm;

/// Stack of cross-attention blocks followed by a final layer norm
///
/// Weight paths: `decoder_blocks.{i}.*`, `decoder_norm.*`
#[derive(Debug)]
pub struct DecoderStack {
    blocks: Vec<CrossAttentionBlock>,
    norm: LayerNorm,
}

impl DecoderStack {
    pub fn load(vb: VarBuilder, config: &CounterConfig) -> Result<Self> {
        let dim = config.decoder_embed_dim;
        let blocks = (0..config.decoder_depth)
            .map(|i| {
                CrossAttentionBlock::load(
                    vb.pp(format!("decoder_blocks.{i}")),
                    dim,
                    config.latent_dim,
                    config.decoder_num_heads,
                    config.mlp_hidden_dim(),
                    config.layer_norm_eps,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::load(vb.pp("decoder_norm"), dim, config.layer_norm_eps)?;
        Ok(Self { blocks, norm })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Refine patch tokens `x` [N, P, D] against exemplar tokens `y` [N, S, D].
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x, y)?;
        }
        self.norm.forward(&x)
    }
}
