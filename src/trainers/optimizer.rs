//! Optimisers over named trainable variables
//!
//! Gradients arrive keyed by parameter name (see `GradientAccumulator`), so
//! optimiser state is keyed the same way.

use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use crate::error::{FinetuneError, Result};
use crate::trainers::adam8bit::Adam8bit;

pub const OPTIMIZER_KINDS: [&str; 2] = ["AdamW", "AdamW8bit"];

#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 5e-6,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-2,
        }
    }
}

pub trait Optimizer: Send {
    /// One update of every parameter that has a gradient.
    fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Adam with decoupled weight decay and full-precision moments.
pub struct AdamW {
    params: AdamParams,
    first_moment: HashMap<String, Tensor>,
    second_moment: HashMap<String, Tensor>,
    step: usize,
}

impl AdamW {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            first_moment: HashMap::new(),
            second_moment: HashMap::new(),
            step: 0,
        }
    }

    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let grad = grad.to_dtype(DType::F32)?;

        let m = match self.first_moment.get(name) {
            Some(m) => ((m * beta1)? + (&grad * (1.0 - beta1))?)?,
            None => (&grad * (1.0 - beta1))?,
        };
        let v = match self.second_moment.get(name) {
            Some(v) => ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
            None => (grad.sqr()? * (1.0 - beta2))?,
        };

        let t = self.step.max(1) as i32;
        let m_hat = (&m / (1.0 - beta1.powi(t)))?;
        let v_hat = (&v / (1.0 - beta2.powi(t)))?;
        let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

        let current = param.as_tensor();
        let decayed = if weight_decay > 0.0 {
            (current * (1.0 - lr * weight_decay))?
        } else {
            current.clone()
        };
        param.set(&(decayed - (update * lr)?)?)?;

        self.first_moment.insert(name.to_string(), m);
        self.second_moment.insert(name.to_string(), v);
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()> {
        self.step += 1;
        for (name, var) in params {
            if let Some(grad) = grads.get(name) {
                self.update(name, var, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

pub fn create_optimizer(kind: &str, params: AdamParams) -> Result<Box<dyn Optimizer>> {
    match kind {
        "AdamW" => Ok(Box::new(AdamW::new(params))),
        "AdamW8bit" => Ok(Box::new(Adam8bit::new(params))),
        other => Err(FinetuneError::config(format!(
            "Optimizer {} not supported yet.",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    // minimise (x - 3)^2 from x = 0
    fn descend(kind: &str) -> f32 {
        let var = Var::new(&[0f32], &Device::Cpu).unwrap();
        let mut opt = create_optimizer(
            kind,
            AdamParams {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();
        let params = vec![("x".to_string(), var.clone())];
        for _ in 0..200 {
            let loss = (var.as_tensor() - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            let mut named = HashMap::new();
            named.insert("x".to_string(), grads.get(var.as_tensor()).unwrap().clone());
            opt.step(&params, &named).unwrap();
        }
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_adamw_converges() {
        assert!((descend("AdamW") - 3.0).abs() < 0.15);
    }

    #[test]
    fn test_adamw8bit_converges() {
        assert!((descend("AdamW8bit") - 3.0).abs() < 0.2);
    }

    #[test]
    fn test_weight_decay_is_decoupled() {
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut opt = AdamW::new(AdamParams {
            lr: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        });
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0f32], &Device::Cpu).unwrap());
        opt.step(&[("w".to_string(), var.clone())], &grads).unwrap();
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_optimizer() {
        assert!(create_optimizer("SGD", AdamParams::default())
            .err()
            .unwrap()
            .is_configuration());
    }
}
