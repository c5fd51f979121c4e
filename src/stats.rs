use candle_core::{DType, Result, Tensor};

/// Estimated object count per image: spatial sum of a density map [N, H, W] -> [N]
pub fn estimate_counts(density: &Tensor) -> Result<Tensor> {
    let _ = density.dims3()?;
    density.sum((1, 2))
}

/// Summary statistics of a predicted density map
#[derive(Debug, Clone, PartialEq)]
pub struct DensityStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Per-image count estimate
    pub counts: Vec<f32>,
}

impl DensityStats {
    pub fn from_density(density: &Tensor) -> Result<Self> {
        let shape = density.dims().to_vec();
        let density = density.to_dtype(DType::F32)?;
        let data: Vec<f32> = density.flatten_all()?.to_vec1()?;
        if data.is_empty() {
            candle_core::bail!("empty density map {shape:?}");
        }

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mean = data.iter().sum::<f32>() / data.len() as f32;
        let counts = estimate_counts(&density)?.to_vec1()?;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            counts,
        })
    }

}
