//! Gradient accumulation helper

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::HashMap;

use crate::error::Result;

/// Sums per-parameter gradients over micro-batches and counts them.
pub struct GradientAccumulator {
    steps: usize,
    micro_steps: usize,
    accumulated_grads: HashMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            micro_steps: 0,
            accumulated_grads: HashMap::new(),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Micro-batches accumulated since the last reset.
    pub fn pending(&self) -> usize {
        self.micro_steps
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        if let Some(acc) = self.accumulated_grads.get_mut(name) {
            *acc = (&*acc + grad)?;
        } else {
            self.accumulated_grads.insert(name.to_string(), grad.clone());
        }
        Ok(())
    }

    /// Pulls the gradient of every listed variable out of a backward pass.
    pub fn accumulate_store(&mut self, params: &[(String, Var)], grads: &GradStore) -> Result<()> {
        for (name, var) in params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                self.accumulate(name, grad)?;
            }
        }
        Ok(())
    }

    /// Counts one micro-batch; true when the accumulation group is complete.
    pub fn record_micro_step(&mut self) -> bool {
        self.micro_steps += 1;
        self.micro_steps >= self.steps
    }

    pub fn get_and_reset(&mut self) -> HashMap<String, Tensor> {
        self.micro_steps = 0;
        std::mem::take(&mut self.accumulated_grads)
    }
}

/// Global L2 norm over all gradients.
pub fn grad_norm(grads: &HashMap<String, Tensor>) -> Result<f64> {
    let mut total = 0f64;
    for grad in grads.values() {
        let sq = grad
            .to_dtype(candle_core::DType::F32)?
            .sqr()?
            .sum_all()?
            .to_scalar::<f32>()?;
        total += sq as f64;
    }
    Ok(total.sqrt())
}

/// Rescales gradients in place so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut HashMap<String, Tensor>, max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads)?;
    if norm > max_norm && norm > 0.0 {
        let factor = max_norm / (norm + 1e-6);
        for grad in grads.values_mut() {
            *grad = (&*grad * factor)?;
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_boundary_every_n_micro_steps() {
        let mut acc = GradientAccumulator::new(3);
        let boundaries: Vec<bool> = (0..6)
            .map(|_| {
                let hit = acc.record_micro_step();
                if hit {
                    acc.get_and_reset();
                }
                hit
            })
            .collect();
        assert_eq!(boundaries, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_accumulate_from_backward() -> Result<()> {
        let var = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let params = vec![("w".to_string(), var.clone())];
        let mut acc = GradientAccumulator::new(2);
        for _ in 0..2 {
            let loss = var.as_tensor().sqr()?.sum_all()?;
            acc.accumulate_store(&params, &loss.backward()?)?;
        }
        let grads = acc.get_and_reset();
        assert_eq!(grads["w"].to_vec1::<f32>()?, vec![4.0, 8.0]);
        assert_eq!(acc.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let mut grads = HashMap::new();
        grads.insert("a".to_string(), Tensor::new(&[3f32], &Device::Cpu)?);
        grads.insert("b".to_string(), Tensor::new(&[4f32], &Device::Cpu)?);
        let norm = clip_grad_norm(&mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grad_norm(&grads)? - 1.0).abs() < 1e-4);
        Ok(())
    }
}
