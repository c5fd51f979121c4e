//! Weight initialization policy.
//!
//! Initialization happens once, at variable creation: every trainable
//! variable is created through one of the helpers below with the matching
//! [`Init`] hint. When the `VarBuilder` is backed by a checkpoint the hints
//! are ignored and the stored weights are used as-is.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Standard deviation of the learned shot token.
pub const SHOT_TOKEN_STD: f64 = 0.02;

/// Normalization scale initializer.
pub const NORM_WEIGHT: Init = Init::Const(1.0);

/// Normalization shift and linear bias initializer.
pub const ZEROS: Init = Init::Const(0.0);

/// Xavier/Glorot uniform bound for a `fan_in -> fan_out` weight.
pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Xavier/Glorot uniform initializer (JAX ViT convention).
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = xavier_bound(fan_in, fan_out);
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Linear layer with Xavier-uniform weight and zero bias.
pub fn linear_xavier(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", xavier_uniform(in_dim, out_dim))?;
    let bias = vb.get_with_hints(out_dim, "bias", ZEROS)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Learned shot token of width `dim`, drawn from N(0, 0.02^2).
pub fn shot_token(dim: usize, vb: VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(
        dim,
        "shot_token",
        Init::Randn {
            mean: 0.0,
            stdev: SHOT_TOKEN_STD,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Module, VarMap};

    #[test]
    fn test_xavier_bound() {
        // sqrt(6 / (512 + 2048))
        assert!((xavier_bound(512, 2048) - 0.048412).abs() < 1e-5);
        assert_eq!(xavier_bound(3, 3), 1.0);
    }

    #[test]
    fn test_linear_xavier() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let linear = linear_xavier(64, 192, vb.pp("qkv")).unwrap();
        let bound = xavier_bound(64, 192) as f32;

        let weight = linear.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(weight.len(), 64 * 192);
        assert!(weight.iter().all(|w| w.abs() <= bound));
        // Spread over the interval rather than collapsed to a constant
        let max = weight.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(max > bound * 0.9, "max {max} vs bound {bound}");

        let bias = linear.bias().unwrap().to_vec1::<f32>().unwrap();
        assert!(bias.iter().all(|b| *b == 0.0));

        let out = linear
            .forward(&Tensor::ones((2, 5, 64), DType::F32, &device).unwrap())
            .unwrap();
        assert_eq!(out.dims(), &[2, 5, 192]);

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"qkv.weight".to_string()));
        assert!(names.contains(&"qkv.bias".to_string()));
    }

    #[test]
    fn test_shot_token_statistics() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let token = shot_token(16384, vb).unwrap();
        let values = token.to_vec1::<f32>().unwrap();
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0);
        let std = var.sqrt();

        assert!(mean.abs() < 0.002, "mean {mean}");
        assert!((std - 0.02).abs() < 0.002, "std {std}");
    }
}
