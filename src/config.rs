//! Counting Model Configuration
//!
//! This module defines the configuration record for the counting model and
//! the named size presets (base/large/huge and the deeper base decoders).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Each of the four head stages doubles the grid side.
pub const DENSITY_UPSAMPLE: usize = 16;

/// Named model size presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// ViT-B/16 sizing, 2 decoder blocks
    Base,
    /// ViT-B/16 sizing, 4 decoder blocks
    Base4,
    /// ViT-B/16 sizing, 6 decoder blocks
    Base6,
    /// ViT-L/16 sizing, 2 decoder blocks
    Large,
    /// ViT-H/14 sizing, 2 decoder blocks
    Huge,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Base,
        Preset::Base4,
        Preset::Base6,
        Preset::Large,
        Preset::Huge,
    ];

    pub fn config(&self) -> CounterConfig {
        match self {
            Preset::Base => CounterConfig::base(),
            Preset::Base4 => CounterConfig::base4(),
            Preset::Base6 => CounterConfig::base6(),
            Preset::Large => CounterConfig::large(),
            Preset::Huge => CounterConfig::huge(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Base => "base",
            Preset::Base4 => "base4",
            Preset::Base6 => "base6",
            Preset::Large => "large",
            Preset::Huge => "huge",
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfig(format!("unknown preset `{s}`")))
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the counting model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    // Backbone sizing
    /// Input image resolution (square)
    pub image_size: usize,
    /// Patch size of the backbone's patch embedding
    pub patch_size: usize,
    /// Number of input channels (3 for RGB)
    pub input_channels: usize,
    /// Backbone transformer width
    pub embed_dim: usize,
    /// Backbone transformer depth (reserved, the backbone is opaque)
    pub depth: usize,
    /// Backbone attention heads (reserved, the backbone is opaque)
    pub num_heads: usize,
    /// Width of the backbone's image/text embeddings (512 for CLIP ViT-B/32)
    pub latent_dim: usize,
    /// Vocabulary size of the text encoder
    pub vocab_size: usize,

    // Decoder
    /// Decoder hidden width, must equal `latent_dim`
    pub decoder_embed_dim: usize,
    /// Number of cross-attention blocks
    pub decoder_depth: usize,
    /// Attention heads per decoder block
    pub decoder_num_heads: usize,
    /// Feed-forward expansion ratio
    pub mlp_ratio: usize,
    /// Layer normalization epsilon
    pub layer_norm_eps: f64,

    // Training-specific (kept for checkpoint parity)
    /// Normalize target pixels in the reconstruction loss
    pub norm_pix_loss: bool,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl CounterConfig {
    fn vit(patch_size: usize, embed_dim: usize, depth: usize, num_heads: usize) -> Self {
        Self {
            image_size: 384,
            patch_size,
            input_channels: 3,
            embed_dim,
            depth,
            num_heads,
            latent_dim: 512,
            vocab_size: 49408,
            decoder_embed_dim: 512,
            decoder_depth: 2,
            decoder_num_heads: 16,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            norm_pix_loss: false,
        }
    }

    /// Base model, 2 decoder blocks
    pub fn base() -> Self {
        Self::vit(16, 768, 12, 12)
    }

    /// Base model, 4 decoder blocks
    pub fn base4() -> Self {
        Self {
            decoder_depth: 4,
            ..Self::base()
        }
    }

    /// Base model, 6 decoder blocks
    pub fn base6() -> Self {
        Self {
            decoder_depth: 6,
            ..Self::base()
        }
    }

    /// Large model
    pub fn large() -> Self {
        Self::vit(16, 1024, 24, 16)
    }

    /// Huge model
    ///
    /// 384 is not a multiple of the 14px patch, so the huge preset runs at
    /// 392 (a 28x28 patch grid).
    pub fn huge() -> Self {
        Self {
            image_size: 392,
            ..Self::vit(14, 1280, 32, 16)
        }
    }

    /// Parse a JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration from disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Check the structural constraints the model relies on.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("image_size", self.image_size),
            ("patch_size", self.patch_size),
            ("input_channels", self.input_channels),
            ("embed_dim", self.embed_dim),
            ("latent_dim", self.latent_dim),
            ("vocab_size", self.vocab_size),
            ("decoder_embed_dim", self.decoder_embed_dim),
            ("decoder_num_heads", self.decoder_num_heads),
            ("mlp_ratio", self.mlp_ratio),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
        if self.decoder_embed_dim % self.decoder_num_heads != 0 {
            return Err(Error::HeadCount {
                dim: self.decoder_embed_dim,
                num_heads: self.decoder_num_heads,
            });
        }
        if self.image_size % self.patch_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "image_size {} is not a multiple of patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.latent_dim != self.decoder_embed_dim {
            return Err(Error::EmbedDimMismatch {
                what: "decoder_embed_dim vs backbone latent_dim",
                expected: self.latent_dim,
                got: self.decoder_embed_dim,
            });
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(Error::InvalidConfig("layer_norm_eps must be positive".into()));
        }
        Ok(())
    }

    /// Side of the patch grid for `image_size` inputs
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Number of patch tokens for `image_size` inputs
    pub fn num_patches(&self) -> usize {
        self.grid_size().pow(2)
    }

    /// Side of the predicted density map for `image_size` inputs
    pub fn density_size(&self) -> usize {
        self.grid_size() * DENSITY_UPSAMPLE
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        self.decoder_embed_dim * self.mlp_ratio
    }
}

#[cfg(test)]
impl CounterConfig {
    /// Small configuration for fast CPU tests.
    pub(crate) fn tiny() -> Self {
        Self {
            image_size: 64,
            patch_size: 16,
            input_channels: 3,
            embed_dim: 48,
            depth: 2,
            num_heads: 4,
            latent_dim: 32,
            vocab_size: 128,
            decoder_embed_dim: 32,
            decoder_depth: 2,
            decoder_num_heads: 4,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            norm_pix_loss: false,
        }
    }
}
