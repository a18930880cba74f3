//! Exponential moving average of trainable weights

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FinetuneError, Result};
use crate::models::LayerGraph;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub inv_gamma: f64,
    pub power: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub update_after_step: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            inv_gamma: 1.0,
            power: 0.75,
            min_value: 0.0,
            max_value: 0.9999,
            update_after_step: 0,
        }
    }
}

impl EmaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inv_gamma <= 0.0 {
            return Err(FinetuneError::config("ema_inv_gamma must be positive"));
        }
        if self.min_value > self.max_value {
            return Err(FinetuneError::config(format!(
                "ema_min_value {} exceeds ema_max_value {}",
                self.min_value, self.max_value
            )));
        }
        if self.min_value < 0.0 || self.max_value > 1.0 {
            return Err(FinetuneError::config("EMA decay bounds must lie in [0, 1]"));
        }
        Ok(())
    }

    /// Warmup decay `1 - (1 + s / inv_gamma)^-power` at optimisation step
    /// `step`, with `s = step - update_after_step - 1`, clamped to
    /// `[min_value, max_value]`. Non-decreasing in `step`.
    pub fn decay_at(&self, step: usize) -> f64 {
        let s = step.saturating_sub(self.update_after_step + 1) as f64;
        let value = 1.0 - (1.0 + s / self.inv_gamma).powf(-self.power);
        value.clamp(self.min_value, self.max_value)
    }
}

/// Shadow copy of one model's trainable parameters.
pub struct EMATracker {
    config: EmaConfig,
    averaged: HashMap<String, Tensor>,
    optimization_step: usize,
    decay: f64,
}

impl EMATracker {
    pub fn new(config: EmaConfig, live: &LayerGraph) -> Result<Self> {
        config.validate()?;
        let mut averaged = HashMap::new();
        for (name, var) in live.trainable_vars() {
            averaged.insert(name, var.as_tensor().copy()?);
        }
        Ok(Self {
            config,
            averaged,
            optimization_step: 0,
            decay: config.decay_at(0),
        })
    }

    /// `averaged = decay * averaged + (1 - decay) * live` for every tracked
    /// parameter. Call once per synchronized optimiser step.
    pub fn step(&mut self, live: &LayerGraph) -> Result<f64> {
        self.optimization_step += 1;
        self.decay = self.config.decay_at(self.optimization_step);
        let blend = 1.0 - self.decay;
        for (name, var) in live.trainable_vars() {
            let current = var.as_tensor().detach();
            let updated = match self.averaged.get(&name) {
                Some(avg) => (avg + ((current - avg)? * blend)?)?,
                None => current.copy()?,
            };
            self.averaged.insert(name, updated);
        }
        Ok(self.decay)
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn optimization_step(&self) -> usize {
        self.optimization_step
    }

    pub fn averaged_weights(&self) -> &HashMap<String, Tensor> {
        &self.averaged
    }

    /// Frozen copy of `live` carrying the averaged weights.
    pub fn averaged_graph(&self, live: &LayerGraph) -> LayerGraph {
        live.with_weights(&self.averaged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BaseLayer, LayerOp};
    use candle_core::{DType, Device};

    #[test]
    fn test_decay_monotone_and_bounded() {
        for config in [
            EmaConfig::default(),
            EmaConfig {
                min_value: 0.3,
                max_value: 0.9,
                power: 2.0 / 3.0,
                update_after_step: 5,
                ..Default::default()
            },
        ] {
            let decays: Vec<f64> = (0..5000).map(|s| config.decay_at(s)).collect();
            assert!(decays.windows(2).all(|w| w[1] >= w[0]));
            assert!(decays
                .iter()
                .all(|&d| d >= config.min_value && d <= config.max_value));
            assert_eq!(decays[0], config.min_value);
            assert_eq!(decays[4999], config.decay_at(4999));
        }
        // 1 - (1 + 9)^-0.75
        let d = EmaConfig::default().decay_at(10);
        assert!((d - (1.0 - 10f64.powf(-0.75))).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let config = EmaConfig {
            min_value: 0.9,
            max_value: 0.1,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_shadow_follows_live_weights() -> Result<()> {
        let device = Device::Cpu;
        let mut graph = LayerGraph::new();
        let op = LayerOp::Linear {
            in_features: 2,
            out_features: 1,
        };
        let base = BaseLayer::new(op, Tensor::zeros((1, 2), DType::F32, &device)?, None)?;
        graph.push("proj", "Test", base.into_trainable()?)?;

        let mut ema = EMATracker::new(EmaConfig::default(), &graph)?;
        let (_, var) = graph.trainable_vars().remove(0);
        var.set(&Tensor::ones((1, 2), DType::F32, &device)?)?;

        // first steps have decay 0, so the shadow jumps to the live value
        let decay = ema.step(&graph)?;
        assert_eq!(decay, 0.0);
        let avg = ema.averaged_weights()["proj.weight"].to_vec2::<f32>()?;
        assert_eq!(avg, vec![vec![1.0, 1.0]]);

        var.set(&Tensor::full(3f32, (1, 2), &device)?)?;
        ema.step(&graph)?;
        ema.step(&graph)?;
        let d = ema.decay();
        assert!(d > 0.0 && d < 1.0);
        let avg = ema.averaged_weights()["proj.weight"].to_vec2::<f32>()?;
        assert!(avg[0][0] > 1.0 && avg[0][0] < 3.0);

        let shadow = ema.averaged_graph(&graph);
        assert!(shadow.trainable_vars().is_empty());
        let y = shadow.forward("proj", &Tensor::ones((1, 2), DType::F32, &device)?)?;
        assert!((y.to_vec2::<f32>()?[0][0] - 2.0 * avg[0][0]).abs() < 1e-5);
        Ok(())
    }
}
