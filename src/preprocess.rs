//! Image Preprocessing for the CLIP backbone
//!
//! The backbone expects the CLIP training distribution:
//! 1. Resize the shorter side to the model resolution and center-crop to a square
//! 2. Convert to a CHW tensor with values in [0, 1]
//! 3. Normalize with the CLIP mean and std
//!
//! Feeding differently normalized images does not fail, it silently degrades
//! the counts.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// CLIP normalization mean values (RGB order)
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];

/// CLIP normalization std values (RGB order)
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

pub fn load_image(path: impl AsRef<Path>) -> anyhow::Result<DynamicImage> {
    let path = path.as_ref();
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

/// Resize-and-center-crop `img` to `size x size`, then convert to a
/// [3, size, size] tensor with values in [0, 1].
pub fn image_to_tensor(img: &DynamicImage, size: usize, device: &Device) -> Result<Tensor> {
    let img = img
        .resize_to_fill(size as u32, size as u32, FilterType::CatmullRom)
        .to_rgb8();
    let (width, height) = img.dimensions();
    let data = img.into_raw();

    // HWC u8 -> CHW f32
    Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        / 255.0
}

/// Normalize a [3, H, W] tensor with the CLIP mean and std.
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&CLIP_MEAN, (3, 1, 1), device)?.to_dtype(tensor.dtype())?;
    let std = Tensor::from_slice(&CLIP_STD, (3, 1, 1), device)?.to_dtype(tensor.dtype())?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Full pipeline for a decoded image: [3, size, size]
pub fn preprocess(img: &DynamicImage, size: usize, device: &Device) -> Result<Tensor> {
    let tensor = image_to_tensor(img, size, device)?;
    let normalized = normalize(&tensor)?;
    tracing::debug!(
        width = img.width(),
        height = img.height(),
        size,
        "preprocessed image"
    );
    Ok(normalized)
}

/// Load and preprocess one image from disk: [3, size, size]
pub fn preprocess_image(
    path: impl AsRef<Path>,
    size: usize,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let img = load_image(path)?;
    Ok(preprocess(&img, size, device)?)
}

/// Preprocess a batch of decoded images: [N, 3, size, size]
pub fn preprocess_batch(images: &[DynamicImage], size: usize, device: &Device) -> Result<Tensor> {
    if images.is_empty() {
        candle_core::bail!("cannot build an empty image batch");
    }
    let tensors = images
        .iter()
        .map(|img| preprocess(img, size, device))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&tensors, 0)
}
