//! Frozen vision-language backbone.
//!
//! The counting model only needs two things from its backbone: patch-level
//! image latents and pooled text embeddings, both in the same latent width.
//! [`VisionLanguageEncoder`] is that contract; [`BackboneAdapter`] wraps any
//! implementation, checks the shapes it hands back and cuts the outputs out
//! of the autograd graph so nothing upstream of the decoder ever receives a
//! gradient.
//!
//! [`PatchEncoder`] is a small encoder that satisfies the contract with a
//! patch-embedding convolution and a token-embedding text tower. It is what
//! [`crate::ClipCounter::build`] uses when no pretrained backbone is supplied;
//! the pretrained CLIP towers live in [`crate::clip::ClipBackbone`].

use candle_core::{Module, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, linear_no_bias, Conv2d, Conv2dConfig, Embedding, Linear,
    VarBuilder,
};

use crate::config::CounterConfig;
use crate::error::{Error, Result};
use crate::labels::PAD_TOKEN_ID;
use crate::model::norm::LayerNorm;

/// Encoder exposing image and text embeddings of a shared width.
pub trait VisionLanguageEncoder: Send + Sync {
    /// Images [N, C, H, W] to patch latents [N, P, D].
    fn encode_image(&self, images: &Tensor) -> candle_core::Result<Tensor>;

    /// Token ids [B, L] to one embedding per sequence [B, D].
    fn encode_text(&self, token_ids: &Tensor) -> candle_core::Result<Tensor>;

    /// Width `D` of both embeddings.
    fn embed_dim(&self) -> usize;
}

/// Gradient-isolated, shape-checked view over a [`VisionLanguageEncoder`].
pub struct BackboneAdapter {
    encoder: Box<dyn VisionLanguageEncoder>,
}

impl std::fmt::Debug for BackboneAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackboneAdapter")
            .field("embed_dim", &self.embed_dim())
            .finish_non_exhaustive()
    }
}

impl BackboneAdapter {
    pub fn new(encoder: impl VisionLanguageEncoder + 'static) -> Self {
        Self {
            encoder: Box::new(encoder),
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.encoder.embed_dim()
    }

    /// Encode images [N, C, H, W] into detached patch latents [N, P, D].
    pub fn encode_image(&self, images: &Tensor) -> Result<Tensor> {
        let (n, _, _, _) = images.dims4().map_err(|_| Error::UnexpectedShape {
            what: "images",
            shape: images.dims().to_vec(),
        })?;

        let latent = self.encoder.encode_image(images)?.detach();
        let (batch, _, width) = latent.dims3().map_err(|_| Error::UnexpectedShape {
            what: "image latent",
            shape: latent.dims().to_vec(),
        })?;
        if batch != n {
            return Err(Error::BatchMismatch {
                what: "image latent",
                expected: n,
                got: batch,
            });
        }
        self.check_width("image latent", width)?;
        tracing::debug!(shape = ?latent.dims(), "encoded images");
        Ok(latent)
    }

    /// Encode per-image label token ids [N, S, L] into detached exemplar
    /// embeddings [N, S, D].
    pub fn encode_text(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (n, shots, len) = token_ids.dims3().map_err(|_| Error::UnexpectedShape {
            what: "label token ids",
            shape: token_ids.dims().to_vec(),
        })?;

        let flat = token_ids.reshape((n * shots, len))?;
        let embedded = self.encoder.encode_text(&flat)?.detach();
        let (rows, width) = embedded.dims2().map_err(|_| Error::UnexpectedShape {
            what: "text embedding",
            shape: embedded.dims().to_vec(),
        })?;
        if rows != n * shots {
            return Err(Error::BatchMismatch {
                what: "text embedding",
                expected: n * shots,
                got: rows,
            });
        }
        self.check_width("text embedding", width)?;
        let context = embedded.reshape((n, shots, width))?;
        tracing::debug!(shape = ?context.dims(), "encoded labels");
        Ok(context)
    }

    fn check_width(&self, what: &'static str, width: usize) -> Result<()> {
        let expected = self.embed_dim();
        if width != expected {
            return Err(Error::EmbedDimMismatch {
                what,
                expected,
                got: width,
            });
        }
        Ok(())
    }
}

/// Sizing of a [`PatchEncoder`]
#[derive(Debug, Clone, PartialEq)]
pub struct PatchEncoderConfig {
    pub patch_size: usize,
    pub input_channels: usize,
    /// Internal width of both towers
    pub hidden_dim: usize,
    /// Output width of both towers
    pub latent_dim: usize,
    pub vocab_size: usize,
}

impl PatchEncoderConfig {
    pub fn from_counter(config: &CounterConfig) -> Self {
        Self {
            patch_size: config.patch_size,
            input_channels: config.input_channels,
            hidden_dim: config.embed_dim,
            latent_dim: config.latent_dim,
            vocab_size: config.vocab_size,
        }
    }
}

/// Patch-embedding image tower and mean-pooled text tower.
///
/// Weight paths: `visual.conv1`, `visual.ln_post`, `visual.proj`,
/// `token_embedding`, `text_projection`.
#[derive(Debug)]
pub struct PatchEncoder {
    conv1: Conv2d,
    ln_post: LayerNorm,
    proj: Linear,
    token_embedding: Embedding,
    text_projection: Linear,
    latent_dim: usize,
}

impl PatchEncoder {
    pub fn load(vb: VarBuilder, config: &PatchEncoderConfig) -> candle_core::Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let visual = vb.pp("visual");
        let conv1 = conv2d_no_bias(
            config.input_channels,
            config.hidden_dim,
            config.patch_size,
            conv_config,
            visual.pp("conv1"),
        )?;
        let ln_post = LayerNorm::load(visual.pp("ln_post"), config.hidden_dim, 1e-5)?;
        let proj = linear_no_bias(config.hidden_dim, config.latent_dim, visual.pp("proj"))?;

        let token_embedding =
            embedding(config.vocab_size, config.hidden_dim, vb.pp("token_embedding"))?;
        let text_projection =
            linear_no_bias(config.hidden_dim, config.latent_dim, vb.pp("text_projection"))?;

        Ok(Self {
            conv1,
            ln_post,
            proj,
            token_embedding,
            text_projection,
            latent_dim: config.latent_dim,
        })
    }
}

impl VisionLanguageEncoder for PatchEncoder {
    fn encode_image(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        // (N, C, H, W) -> (N, hidden, H/p, W/p) -> (N, P, hidden)
        let xs = self.conv1.forward(images)?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?;
        let xs = self.ln_post.forward(&xs)?;
        self.proj.forward(&xs)
    }

    fn encode_text(&self, token_ids: &Tensor) -> candle_core::Result<Tensor> {
        let embedded = self.token_embedding.forward(token_ids)?; // (B, L, hidden)

        // Mean over non-padding positions; an all-padding row pools to zero.
        let mask = token_ids
            .ne(PAD_TOKEN_ID)?
            .to_dtype(embedded.dtype())?
            .unsqueeze(2)?;
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1.0)?;
        let pooled = summed.broadcast_div(&counts)?;

        self.text_projection.forward(&pooled)
    }

    fn embed_dim(&self) -> usize {
        self.latent_dim
    }
}
