//! Pretrained CLIP backbone
//!
//! Wraps the CLIP towers from `candle-transformers` as a
//! [`VisionLanguageEncoder`]. The counting decoder attends over patch tokens,
//! so the image side does not use the pooled `get_image_features` output:
//! the last encoder layer is taken before pooling, the class token dropped,
//! and every patch token goes through `post_layernorm` and
//! `visual_projection`. The text side is `text_projection(text_model(ids))`,
//! which is what `ClipModel::get_text_features` computes.
//!
//! Weight paths match the Hugging Face `openai/clip-vit-base-patch32`
//! checkpoint: `vision_model.*`, `visual_projection`, `text_model.*`,
//! `text_projection`.

use candle_core::{Module, Tensor};
use candle_nn::{layer_norm, linear_no_bias, LayerNorm, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::ClipTextTransformer;
use candle_transformers::models::clip::vision_model::ClipVisionTransformer;
use candle_transformers::models::clip::ClipConfig;

use crate::backbone::VisionLanguageEncoder;
use crate::error::{Error, Result};

const POST_LAYER_NORM_EPS: f64 = 1e-5;

/// CLIP ViT image and text towers exposing patch-level image latents.
pub struct ClipBackbone {
    vision_model: ClipVisionTransformer,
    post_layernorm: LayerNorm,
    visual_projection: Linear,
    text_model: ClipTextTransformer,
    text_projection: Linear,
    num_patches: usize,
    projection_dim: usize,
}

impl std::fmt::Debug for ClipBackbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipBackbone")
            .field("num_patches", &self.num_patches)
            .field("projection_dim", &self.projection_dim)
            .finish_non_exhaustive()
    }
}

impl ClipBackbone {
    /// Load both towers from `vb`. Pass a builder over the frozen parameter
    /// group, or over the pretrained safetensors.
    pub fn load(vb: VarBuilder, config: &ClipConfig) -> Result<Self> {
        let vision = &config.vision_config;
        let text = &config.text_config;
        if vision.projection_dim != text.projection_dim {
            return Err(Error::EmbedDimMismatch {
                what: "CLIP text vs vision projection",
                expected: vision.projection_dim,
                got: text.projection_dim,
            });
        }
        if vision.patch_size == 0 || vision.image_size % vision.patch_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "CLIP image_size {} is not a multiple of patch_size {}",
                vision.image_size, vision.patch_size
            )));
        }

        let vision_model = ClipVisionTransformer::new(vb.pp("vision_model"), vision)?;
        let post_layernorm = layer_norm(
            vision.embed_dim,
            POST_LAYER_NORM_EPS,
            vb.pp("vision_model.post_layernorm"),
        )?;
        let visual_projection = linear_no_bias(
            vision.embed_dim,
            vision.projection_dim,
            vb.pp("visual_projection"),
        )?;
        let text_model = ClipTextTransformer::new(vb.pp("text_model"), text)?;
        let text_projection =
            linear_no_bias(text.embed_dim, text.projection_dim, vb.pp("text_projection"))?;

        let side = vision.image_size / vision.patch_size;
        tracing::info!(
            image_size = vision.image_size,
            patch_size = vision.patch_size,
            projection_dim = vision.projection_dim,
            "loaded CLIP backbone"
        );

        Ok(Self {
            vision_model,
            post_layernorm,
            visual_projection,
            text_model,
            text_projection,
            num_patches: side * side,
            projection_dim: vision.projection_dim,
        })
    }

    /// Patch tokens per image at the configured resolution.
    pub fn num_patches(&self) -> usize {
        self.num_patches
    }
}

impl VisionLanguageEncoder for ClipBackbone {
    fn encode_image(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        // Per-layer [N, 1 + P, E] outputs, followed by the pooled [N, E]
        let hidden_states = self.vision_model.output_hidden_states(images)?;
        let last = hidden_states
            .iter()
            .rev()
            .find(|t| t.rank() == 3)
            .ok_or_else(|| candle_core::Error::Msg("CLIP vision tower returned no layers".into()))?;

        let patches = last.narrow(1, 1, last.dim(1)? - 1)?;
        let patches = self.post_layernorm.forward(&patches)?;
        self.visual_projection.forward(&patches)
    }

    fn encode_text(&self, token_ids: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = self.text_model.forward(token_ids)?;
        self.text_projection.forward(&pooled)
    }

    fn embed_dim(&self) -> usize {
        self.projection_dim
    }
}
