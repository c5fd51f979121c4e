pub mod attention;
pub mod decoder;
pub mod density_head;
pub mod norm;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::ClipConfig;

use crate::backbone::{BackboneAdapter, PatchEncoder, PatchEncoderConfig};
use crate::clip::ClipBackbone;
use crate::config::CounterConfig;
use crate::error::{Error, Result};
use crate::init;
use crate::model::decoder::DecoderStack;
use crate::model::density_head::{square_side, DensityHead};
use crate::params::ParamGroups;

/// Few-shot object counting model
///
/// Frozen vision-language backbone, a cross-attention decoder that refines
/// the patch latents against the shot embeddings, and a convolutional head
/// regressing a density map whose spatial sum is the object count.
pub struct ClipCounter {
    /// Model configuration
    pub config: CounterConfig,
    /// Frozen image/text encoder
    backbone: BackboneAdapter,
    /// Learned context used when no shots are given
    shot_token: Tensor,
    /// Cross-attention decoder
    decoder: DecoderStack,
    /// Density regression head
    density_head: DensityHead,
}

impl ClipCounter {
    /// Build the trainable part of the model from `vb` around an existing backbone.
    ///
    /// Weight paths: `shot_token`, `decoder_blocks.*`, `decoder_norm.*`,
    /// `decode_head{0..3}.*`. A fresh `VarMap`-backed builder applies the
    /// initialization policy; a checkpoint-backed builder loads as-is.
    pub fn load(vb: VarBuilder, config: &CounterConfig, backbone: BackboneAdapter) -> Result<Self> {
        config.validate()?;
        if backbone.embed_dim() != config.latent_dim {
            return Err(Error::EmbedDimMismatch {
                what: "backbone width vs latent_dim",
                expected: config.latent_dim,
                got: backbone.embed_dim(),
            });
        }

        let shot_token = init::shot_token(config.latent_dim, vb.clone())?;
        let decoder = DecoderStack::load(vb.clone(), config)?;
        let density_head = DensityHead::load(vb, config.decoder_embed_dim)?;

        tracing::info!(
            decoder_depth = config.decoder_depth,
            decoder_embed_dim = config.decoder_embed_dim,
            decoder_num_heads = config.decoder_num_heads,
            "built counting model"
        );

        Ok(Self {
            config: config.clone(),
            backbone,
            shot_token,
            decoder,
            density_head,
        })
    }

    /// Build a freshly initialized model with a [`PatchEncoder`] backbone.
    ///
    /// Backbone variables go into the frozen group, everything else into the
    /// trainable group.
    pub fn build(
        params: &ParamGroups,
        config: &CounterConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let encoder = PatchEncoder::load(
            params.frozen_builder(dtype, device),
            &PatchEncoderConfig::from_counter(config),
        )?;
        let model = Self::load(
            params.trainable_builder(dtype, device),
            config,
            BackboneAdapter::new(encoder),
        )?;
        let (frozen, trainable) = params.counts();
        tracing::info!(frozen, trainable, "parameter groups");
        Ok(model)
    }

    /// Build a freshly initialized decoder and head around a CLIP backbone.
    ///
    /// The CLIP towers are created in the frozen group. To start from
    /// pretrained CLIP weights, load [`ClipBackbone`] from a checkpoint-backed
    /// builder and hand it to [`ClipCounter::load`] instead.
    pub fn build_with_clip(
        params: &ParamGroups,
        config: &CounterConfig,
        clip_config: &ClipConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let clip = ClipBackbone::load(params.frozen_builder(dtype, device), clip_config)?;
        let side = clip_config.vision_config.image_size / clip_config.vision_config.patch_size;
        let model = Self::load(
            params.trainable_builder(dtype, device),
            config,
            BackboneAdapter::new(clip),
        )?;
        let (frozen, trainable) = params.counts();
        tracing::info!(frozen, trainable, grid = side, "parameter groups");
        Ok(model)
    }

    pub fn shot_token(&self) -> &Tensor {
        &self.shot_token
    }

    /// Patch latents of `images` [N, 3, H, W], detached: [N, P, D]
    pub fn forward_encoder(&self, images: &Tensor) -> Result<Tensor> {
        self.backbone.encode_image(images)
    }

    /// Context sequence for the decoder: [N, S, D], or [N, 1, D] zero-shot.
    ///
    /// With `shot_count == 0` the learned shot token stands in for the
    /// exemplars and `labels` is not read. Otherwise `labels` must be
    /// token ids [N, shot_count, L].
    pub fn exemplar_context(&self, labels: &Tensor, batch: usize, shot_count: usize) -> Result<Tensor> {
        if shot_count == 0 {
            let dim = self.config.latent_dim;
            let context = self
                .shot_token
                .reshape((1, 1, dim))?
                .broadcast_as((batch, 1, dim))?
                .contiguous()?;
            return Ok(context);
        }

        let (n, shots, _) = labels.dims3().map_err(|_| Error::UnexpectedShape {
            what: "label token ids",
            shape: labels.dims().to_vec(),
        })?;
        if shots != shot_count {
            return Err(Error::ShotCountMismatch {
                expected: shot_count,
                got: shots,
            });
        }
        if n != batch {
            return Err(Error::BatchMismatch {
                what: "labels vs images",
                expected: batch,
                got: n,
            });
        }
        self.backbone.encode_text(labels)
    }

    /// Decoder + density head on precomputed latents [N, P, D] and context [N, S, D].
    pub fn forward_decoder(&self, latent: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (_, num_patches, width) = latent.dims3()?;
        if width != self.config.decoder_embed_dim {
            return Err(Error::EmbedDimMismatch {
                what: "image latent vs decoder",
                expected: self.config.decoder_embed_dim,
                got: width,
            });
        }
        if square_side(num_patches).is_none() {
            return Err(Error::NonSquarePatchGrid { num_patches });
        }

        let hidden = self.decoder.forward(latent, context)?;
        tracing::debug!(shape = ?hidden.dims(), "decoder output");
        let density = self.density_head.forward(&hidden)?;
        tracing::debug!(shape = ?density.dims(), "density map");
        Ok(density)
    }

    /// Predict density maps [N, 16·sqrt(P), 16·sqrt(P)].
    ///
    /// # Arguments
    /// * `images` - Preprocessed images [N, 3, H, W]
    /// * `labels` - Shot label token ids [N, shot_count, L]
    /// * `shot_count` - Number of shots per image, 0 for the learned shot token
    pub fn forward(&self, images: &Tensor, labels: &Tensor, shot_count: usize) -> Result<Tensor> {
        let latent = self.forward_encoder(images)?;
        let context = self.exemplar_context(labels, latent.dim(0)?, shot_count)?;
        self.forward_decoder(&latent, &context)
    }

    /// Estimated object count per image: [N]
    pub fn count(&self, images: &Tensor, labels: &Tensor, shot_count: usize) -> Result<Tensor> {
        let density = self.forward(images, labels, shot_count)?;
        Ok(crate::stats::estimate_counts(&density)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::VisionLanguageEncoder;
    use crate::labels::tests::WordTokenizer;
    use crate::labels::{tokenize_labels, CONTEXT_LENGTH};

    fn tiny_model(params: &ParamGroups) -> ClipCounter {
        ClipCounter::build(params, &CounterConfig::tiny(), DType::F32, &Device::Cpu).unwrap()
    }

    fn labels(texts: &[&str], shot_count: usize) -> Tensor {
        tokenize_labels(&WordTokenizer, texts, shot_count, 8, &Device::Cpu).unwrap()
    }

    fn snapshot(params: &ParamGroups, trainable: bool, name: &str) -> Vec<f32> {
        let map = if trainable {
            params.trainable()
        } else {
            params.frozen()
        };
        let data = map.data().lock().unwrap();
        data[name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn all_vars(params: &ParamGroups, trainable: bool) -> Vec<(String, Vec<f32>)> {
        let map = if trainable {
            params.trainable()
        } else {
            params.frozen()
        };
        let data = map.data().lock().unwrap();
        let mut vars: Vec<_> = data
            .iter()
            .map(|(name, var)| {
                let values = var.flatten_all().unwrap().to_vec1::<f32>().unwrap();
                (name.clone(), values)
            })
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    #[test]
    fn test_end_to_end_base() {
        let device = Device::Cpu;
        let config = CounterConfig::base();
        assert_eq!(config.decoder_depth, 2);

        let params = ParamGroups::new();
        let model = ClipCounter::build(&params, &config, DType::F32, &device).unwrap();

        let images = Tensor::zeros((2, 3, 384, 384), DType::F32, &device).unwrap();
        let labels = tokenize_labels(
            &WordTokenizer,
            &["apple; red apple; green apple", "car; parked car; small car"],
            3,
            CONTEXT_LENGTH,
            &device,
        )
        .unwrap();

        let density = model.forward(&images, &labels, 3).unwrap();
        let side = 16 * (config.num_patches() as f64).sqrt() as usize;
        assert_eq!(side, config.density_size());
        assert_eq!(density.dims(), &[2, side, side]);

        let values = density.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "non-finite density");
    }

    #[test]
    fn test_forward_shape_and_determinism() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let model = tiny_model(&params);

        let images = Tensor::randn(0f32, 1., (3, 3, 64, 64), &device).unwrap();
        let labels = labels(&["cat", "dog", "bird; sparrow"], 2);

        let a = model.forward(&images, &labels, 2).unwrap();
        let b = model.forward(&images, &labels, 2).unwrap();
        assert_eq!(a.dims(), &[3, 64, 64]);
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        let counts = model.count(&images, &labels, 2).unwrap();
        assert_eq!(counts.dims(), &[3]);
    }

    #[test]
    fn test_zero_shot_uses_shot_token() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let model = tiny_model(&params);

        let images = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device).unwrap();
        let context = model.exemplar_context(&images, 2, 0).unwrap();
        assert_eq!(context.dims(), &[2, 1, 32]);

        let token = model.shot_token().to_vec1::<f32>().unwrap();
        for row in context.squeeze(1).unwrap().to_vec2::<f32>().unwrap() {
            assert_eq!(row, token);
        }

        // Labels are not consulted in zero-shot mode
        let density = model.forward(&images, &images, 0).unwrap();
        assert_eq!(density.dims(), &[2, 64, 64]);
    }

    fn check_frozen_backbone(shot_count: usize) {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let model = tiny_model(&params);

        let images = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device).unwrap();
        let labels = labels(&["apple; pear; plum", "car"], 3);

        let frozen_before = all_vars(&params, false);
        let watched = [
            "decoder_blocks.0.attn.wv.weight",
            "decoder_blocks.1.mlp.fc2.weight",
            "decoder_norm.weight",
            "decode_head0.0.weight",
            "decode_head3.3.weight",
        ];
        let watched_before: Vec<_> = watched.iter().map(|n| snapshot(&params, true, n)).collect();
        let token_before = snapshot(&params, true, "shot_token");

        let density = model.forward(&images, &labels, shot_count).unwrap();
        let loss = density.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in params.frozen_vars() {
            assert!(grads.get(var.as_tensor()).is_none(), "backbone received a gradient");
        }

        let mut sgd = params.sgd(0.1).unwrap();
        candle_nn::optim::Optimizer::step(&mut sgd, &grads).unwrap();

        assert_eq!(all_vars(&params, false), frozen_before, "backbone changed");
        for (name, before) in watched.iter().zip(watched_before) {
            assert_ne!(snapshot(&params, true, name), before, "{name} did not change");
        }
        let token_after = snapshot(&params, true, "shot_token");
        if shot_count == 0 {
            assert_ne!(token_after, token_before, "shot token did not change");
        } else {
            assert_eq!(token_after, token_before, "unused shot token changed");
        }
    }

    #[test]
    fn test_frozen_backbone_zero_shot() {
        check_frozen_backbone(0);
    }

    #[test]
    fn test_frozen_backbone_with_shots() {
        check_frozen_backbone(3);
    }

    #[test]
    fn test_clip_backbone_end_to_end_frozen() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let clip_config = crate::clip::tests::tiny_clip_config();
        let model = ClipCounter::build_with_clip(
            &params,
            &CounterConfig::tiny(),
            &clip_config,
            DType::F32,
            &device,
        )
        .unwrap();

        let images = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device).unwrap();
        let labels = labels(&["apple; pear", "car"], 2);
        let density = model.forward(&images, &labels, 2).unwrap();
        // 64px / 16px patches -> 4x4 grid -> 64x64 density
        assert_eq!(density.dims(), &[2, 64, 64]);

        let frozen = params.frozen();
        assert!(frozen.data().lock().unwrap().contains_key("visual_projection.weight"));
        assert!(!params
            .trainable()
            .data()
            .lock()
            .unwrap()
            .contains_key("visual_projection.weight"));

        let loss = density.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(!params.frozen_vars().is_empty());
        for var in params.frozen_vars() {
            assert!(grads.get(var.as_tensor()).is_none(), "CLIP received a gradient");
        }
        let decoder_grads = params
            .trainable_vars()
            .iter()
            .filter(|var| grads.get(var.as_tensor()).is_some())
            .count();
        assert!(decoder_grads > 0);
    }

    #[test]
    fn test_clip_backbone_width_must_match_latent() {
        let params = ParamGroups::new();
        let config = CounterConfig {
            latent_dim: 64,
            decoder_embed_dim: 64,
            ..CounterConfig::tiny()
        };
        let result = ClipCounter::build_with_clip(
            &params,
            &config,
            &crate::clip::tests::tiny_clip_config(),
            DType::F32,
            &Device::Cpu,
        );
        assert!(matches!(
            result,
            Err(Error::EmbedDimMismatch {
                expected: 64,
                got: 32,
                ..
            })
        ));
    }

    #[test]
    fn test_non_square_patch_grid() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let model = tiny_model(&params);

        // 32x64 at patch 16 -> 2x4 = 8 patch tokens
        let images = Tensor::zeros((1, 3, 32, 64), DType::F32, &device).unwrap();
        let result = model.forward(&images, &labels(&["cup"], 1), 1);
        assert!(matches!(
            result,
            Err(Error::NonSquarePatchGrid { num_patches: 8 })
        ));
    }

    #[test]
    fn test_shot_count_and_batch_checks() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let model = tiny_model(&params);
        let images = Tensor::zeros((2, 3, 64, 64), DType::F32, &device).unwrap();

        let three = labels(&["a; b; c", "d"], 3);
        assert!(matches!(
            model.forward(&images, &three, 2),
            Err(Error::ShotCountMismatch {
                expected: 2,
                got: 3
            })
        ));

        let one_image = labels(&["a; b"], 2);
        assert!(matches!(
            model.forward(&images, &one_image, 2),
            Err(Error::BatchMismatch {
                expected: 2,
                got: 1,
                ..
            })
        ));
    }

    struct NarrowEncoder;

    impl VisionLanguageEncoder for NarrowEncoder {
        fn encode_image(&self, images: &Tensor) -> candle_core::Result<Tensor> {
            Tensor::zeros((images.dim(0)?, 4, 16), DType::F32, images.device())
        }

        fn encode_text(&self, token_ids: &Tensor) -> candle_core::Result<Tensor> {
            Tensor::zeros((token_ids.dim(0)?, 16), DType::F32, token_ids.device())
        }

        fn embed_dim(&self) -> usize {
            16
        }
    }

    #[test]
    fn test_backbone_width_mismatch() {
        let device = Device::Cpu;
        let params = ParamGroups::new();
        let vb = params.trainable_builder(DType::F32, &device);
        let result = ClipCounter::load(vb, &CounterConfig::tiny(), BackboneAdapter::new(NarrowEncoder));
        assert!(matches!(
            result,
            Err(Error::EmbedDimMismatch {
                expected: 32,
                got: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_initialization_policy() {
        let device = Device::Cpu;
        let config = CounterConfig {
            image_size: 32,
            embed_dim: 16,
            vocab_size: 16,
            latent_dim: 512,
            decoder_embed_dim: 512,
            decoder_num_heads: 8,
            decoder_depth: 1,
            ..CounterConfig::tiny()
        };
        let params = ParamGroups::new();
        let model = ClipCounter::build(&params, &config, DType::F32, &device).unwrap();

        let is_conv = |name: &str| {
            name.starts_with("decode_head") && (name.contains(".0.") || name.contains(".3."))
        };
        let is_group_norm = |name: &str| name.starts_with("decode_head") && name.contains(".1.");

        for (name, values) in all_vars(&params, true) {
            if name == "shot_token" || is_conv(&name) {
                continue;
            }
            let is_norm = name.contains("norm") || is_group_norm(&name);
            if name.ends_with(".bias") {
                assert!(values.iter().all(|v| *v == 0.0), "{name} bias not zero");
            } else if is_norm {
                assert!(values.iter().all(|v| *v == 1.0), "{name} weight not one");
            } else {
                // Linear weight, Xavier uniform
                let data = params.trainable().data().lock().unwrap();
                let (fan_out, fan_in) = data[&name].dims2().unwrap();
                let bound = init::xavier_bound(fan_in, fan_out) as f32;
                assert!(values.iter().all(|v| v.abs() <= bound), "{name} out of bounds");
            }
        }

        let token = model.shot_token().to_vec1::<f32>().unwrap();
        assert_eq!(token.len(), 512);
        let n = token.len() as f32;
        let mean = token.iter().sum::<f32>() / n;
        let std = (token.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0)).sqrt();
        assert!((std - 0.02).abs() < 0.005, "shot token std {std}");
    }
}
