//! Frozen and trainable parameter groups.
//!
//! The backbone's variables live in the frozen group, everything the
//! counting head learns (decoder, density head, shot token) lives in the
//! trainable group. Optimizers are only ever built over the trainable group.

use candle_core::{DType, Device, Result, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW, SGD};
use candle_nn::{VarBuilder, VarMap};

pub struct ParamGroups {
    frozen: VarMap,
    trainable: VarMap,
}

impl Default for ParamGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamGroups {
    pub fn new() -> Self {
        Self {
            frozen: VarMap::new(),
            trainable: VarMap::new(),
        }
    }

    /// Builder for the frozen backbone variables
    pub fn frozen_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.frozen, dtype, device)
    }

    /// Builder for the trainable decoder/head variables
    pub fn trainable_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.trainable, dtype, device)
    }

    pub fn frozen(&self) -> &VarMap {
        &self.frozen
    }

    pub fn trainable(&self) -> &VarMap {
        &self.trainable
    }

    pub fn frozen_vars(&self) -> Vec<Var> {
        self.frozen.all_vars()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.all_vars()
    }

    /// Plain SGD over the trainable group.
    pub fn sgd(&self, learning_rate: f64) -> Result<SGD> {
        SGD::new(self.trainable_vars(), learning_rate)
    }

    /// AdamW over the trainable group.
    pub fn adamw(&self, params: ParamsAdamW) -> Result<AdamW> {
        AdamW::new(self.trainable_vars(), params)
    }

    /// Number of scalar parameters in (frozen, trainable).
    pub fn counts(&self) -> (usize, usize) {
        let count = |vars: Vec<Var>| vars.iter().map(|v| v.elem_count()).sum::<usize>();
        (count(self.frozen_vars()), count(self.trainable_vars()))
    }
}
