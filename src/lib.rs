//! Few-shot object counting with candle
//!
//! A frozen CLIP-style backbone encodes the image into patch latents and the
//! shot descriptions into exemplar embeddings. A cross-attention decoder
//! aligns the patches with the exemplars and a convolutional head regresses a
//! density map at 16x the patch-grid resolution; its sum is the count.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub mod backbone;
pub mod clip;
pub mod config;
pub mod error;
pub mod init;
pub mod labels;
pub mod model;
pub mod params;
pub mod preprocess;
pub mod stats;

pub use backbone::{BackboneAdapter, PatchEncoder, PatchEncoderConfig, VisionLanguageEncoder};
pub use clip::ClipBackbone;
pub use config::{CounterConfig, Preset};
pub use error::{Error, Result};
pub use model::ClipCounter;
pub use params::ParamGroups;
pub use stats::{estimate_counts, DensityStats};
