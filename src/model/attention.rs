//! Cross-Attention Decoder Block
//!
//! Each block refines the image patch tokens against the exemplar tokens:
//! - 1: pre-norm self-attention over the patch tokens
//! - 2: pre-norm cross-attention, queries from the patches, keys/values from the exemplars
//! - 3: pre-norm feed-forward network
//!
//! Every sublayer is added back residually. Weight names follow the cross-ViT
//! checkpoints: `norm0`, `selfattn.*`, `norm1`, `attn.*`, `norm2`, `mlp.*`.

use candle_core::{IndexOp, Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::init::linear_xavier;
use crate::model::norm::LayerNorm;

fn head_dim(dim: usize, num_heads: usize) -> Result<usize> {
    if num_heads == 0 || dim % num_heads != 0 {
        candle_core::bail!("{num_heads} attention heads do not divide embedding width {dim}");
    }
    Ok(dim / num_heads)
}

/// Multi-head self-attention with a fused qkv projection
#[derive(Debug)]
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    pub fn load(vb: VarBuilder, dim: usize, num_heads: usize) -> Result<Self> {
        let head_dim = head_dim(dim, num_heads)?;
        let qkv = linear_xavier(dim, dim * 3, vb.pp("qkv"))?;
        let proj = linear_xavier(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale: 1. / (head_dim as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?; // 3,b,h,n,d
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax(&q.matmul(&k.t()?)?, D::Minus1)?;
        let attn = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&attn)
    }
}

/// Multi-head cross-attention
///
/// Queries come from the primary sequence `x` [B, Nx, C], keys and values
/// from the context sequence `y` [B, Ny, C_ctx]. The key/value projections
/// map the context width onto `C`.
#[derive(Debug)]
pub struct CrossAttention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CrossAttention {
    pub fn load(vb: VarBuilder, dim: usize, context_dim: usize, num_heads: usize) -> Result<Self> {
        let head_dim = head_dim(dim, num_heads)?;
        Ok(Self {
            wq: linear_xavier(dim, dim, vb.pp("wq"))?,
            wk: linear_xavier(context_dim, dim, vb.pp("wk"))?,
            wv: linear_xavier(context_dim, dim, vb.pp("wv"))?,
            proj: linear_xavier(dim, dim, vb.pp("proj"))?,
            num_heads,
            head_dim,
            scale: 1. / (head_dim as f64).sqrt(),
        })
    }

    /// Split [B, N, C] into heads: [B, H, N, D]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (b, nx, c) = x.dims3()?;
        let (by, _ny, _) = y.dims3()?;
        if b != by {
            candle_core::bail!("cross-attention batch mismatch: queries {b}, context {by}");
        }

        let q = (self.split_heads(&self.wq.forward(x)?)? * self.scale)?;
        let k = self.split_heads(&self.wk.forward(y)?)?;
        let v = self.split_heads(&self.wv.forward(y)?)?;

        // [B, H, Nx, Ny]
        let attn = candle_nn::ops::softmax(&q.matmul(&k.t()?)?, D::Minus1)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, nx, c))?;
        self.proj.forward(&out)
    }
}

/// Feed-forward network: Linear -> GELU -> Linear
#[derive(Debug)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn load(vb: VarBuilder, dim: usize, hidden_dim: usize) -> Result<Self> {
        let fc1 = linear_xavier(dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = linear_xavier(hidden_dim, dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = xs.gelu_erf()?;
        self.fc2.forward(&xs)
    }
}

/// Single decoder block
#[derive(Debug)]
pub struct CrossAttentionBlock {
    norm0: LayerNorm,
    self_attn: Attention,
    norm1: LayerNorm,
    cross_attn: CrossAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl CrossAttentionBlock {
    pub fn load(
        vb: VarBuilder,
        dim: usize,
        context_dim: usize,
        num_heads: usize,
        mlp_hidden_dim: usize,
        eps: f64,
    ) -> Result<Self> {
        Ok(Self {
            norm0: LayerNorm::load(vb.pp("norm0"), dim, eps)?,
            self_attn: Attention::load(vb.pp("selfattn"), dim, num_heads)?,
            norm1: LayerNorm::load(vb.pp("norm1"), dim, eps)?,
            cross_attn: CrossAttention::load(vb.pp("attn"), dim, context_dim, num_heads)?,
            norm2: LayerNorm::load(vb.pp("norm2"), dim, eps)?,
            mlp: Mlp::load(vb.pp("mlp"), dim, mlp_hidden_dim)?,
        })
    }

    /// # Arguments
    /// * `x` - Patch tokens [B, P, C]
    /// * `y` - Exemplar tokens [B, S, C_ctx]
    ///
    /// # Returns
    /// Refined patch tokens [B, P, C]
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let x = (x + self.self_attn.forward(&self.norm0.forward(x)?)?)?;
        let x = (&x + self.cross_attn.forward(&self.norm1.forward(&x)?, y)?)?;
        &x + self.mlp.forward(&self.norm2.forward(&x)?)?
    }
}
