//! 8-bit AdamW optimizer for memory-efficient training
//! Stores optimizer moments in 8-bit format to reduce memory usage

use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use crate::error::Result;
use crate::trainers::optimizer::{AdamParams, Optimizer};

/// Offset mapping signed levels [-127, 127] onto the U8 storage range.
const ZERO_POINT: f64 = 128.0;
const LEVELS: f32 = 127.0;

pub struct Adam8bit {
    params: AdamParams,

    // 8-bit quantized states
    m_quantized: HashMap<String, QuantizedTensor>,
    v_quantized: HashMap<String, QuantizedTensor>,

    step: usize,
}

/// Quantized tensor with scale factor
#[derive(Clone, Debug)]
pub struct QuantizedTensor {
    pub data: Tensor, // u8 tensor, zero at ZERO_POINT
    pub scale: f32,
}

impl Adam8bit {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            m_quantized: HashMap::new(),
            v_quantized: HashMap::new(),
            step: 0,
        }
    }

    /// Update a single parameter
    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let grad_f32 = grad.to_dtype(DType::F32)?;

        let (m, v) = match (self.m_quantized.get(name), self.v_quantized.get(name)) {
            (Some(m), Some(v)) => (Self::dequantize(m)?, Self::dequantize(v)?),
            _ => {
                let zeros = grad_f32.zeros_like()?;
                (zeros.clone(), zeros)
            }
        };

        let m_new = ((m * beta1)? + (&grad_f32 * (1.0 - beta1))?)?;
        let v_new = ((v * beta2)? + (grad_f32.sqr()? * (1.0 - beta2))?)?;

        // Bias correction works on the full-precision moments of this step;
        // only the stored copies are quantized.
        let t = self.step.max(1) as i32;
        let m_hat = (&m_new / (1.0 - beta1.powi(t)))?;
        let v_hat = (&v_new / (1.0 - beta2.powi(t)))?.clamp(0.0, f64::INFINITY)?;
        let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

        self.m_quantized.insert(name.to_string(), Self::quantize(&m_new)?);
        self.v_quantized.insert(name.to_string(), Self::quantize(&v_new)?);

        let current = param.as_tensor();
        let decayed = if weight_decay > 0.0 {
            (current * (1.0 - lr * weight_decay))?
        } else {
            current.clone()
        };
        let update = update.to_dtype(param.dtype())?;
        param.set(&(decayed - (update * lr)?)?)?;
        Ok(())
    }

    /// Quantize tensor to 8-bit
    fn quantize(tensor: &Tensor) -> Result<QuantizedTensor> {
        let tensor_f32 = tensor.to_dtype(DType::F32)?;
        let abs_max = tensor_f32.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        let scale = if abs_max > 0.0 { abs_max / LEVELS } else { 1.0 };

        let levels = (tensor_f32 / scale as f64)?
            .round()?
            .clamp(-(LEVELS as f64), LEVELS as f64)?;
        let data = (levels + ZERO_POINT)?.to_dtype(DType::U8)?;
        Ok(QuantizedTensor { data, scale })
    }

    /// Dequantize 8-bit tensor back to float
    fn dequantize(quant: &QuantizedTensor) -> Result<Tensor> {
        let levels = (quant.data.to_dtype(DType::F32)? - ZERO_POINT)?;
        Ok((levels * quant.scale as f64)?)
    }

    /// Number of tracked parameters and bytes of moment storage.
    pub fn memory_stats(&self) -> (usize, usize) {
        let num_params = self.m_quantized.len();
        let total_elements: usize = self.m_quantized.values().map(|m| m.data.elem_count()).sum();
        // one byte per element for each moment plus two f32 scales
        (num_params, 2 * total_elements + num_params * 8)
    }
}

impl Optimizer for Adam8bit {
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_quantize_keeps_sign() -> Result<()> {
        let t = Tensor::new(&[-2.0f32, -0.5, 0.0, 1.0, 2.0], &Device::Cpu)?;
        let q = Adam8bit::quantize(&t)?;
        assert_eq!(q.data.dtype(), DType::U8);
        let back = Adam8bit::dequantize(&q)?.to_vec1::<f32>()?;
        for (a, b) in back.iter().zip([-2.0f32, -0.5, 0.0, 1.0, 2.0]) {
            assert!((a - b).abs() <= 2.0 / 127.0, "{} vs {}", a, b);
        }
        assert!(back[0] < 0.0 && back[1] < 0.0);
        Ok(())
    }

    #[test]
    fn test_memory_stats() -> Result<()> {
        let var = Var::new(&[0f32, 0.0, 0.0], &Device::Cpu)?;
        let mut opt = Adam8bit::new(AdamParams::default());
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0.1f32, -0.2, 0.3], &Device::Cpu)?);
        opt.step(&[("w".to_string(), var)], &grads)?;
        assert_eq!(opt.memory_stats(), (1, 2 * 3 + 8));
        Ok(())
    }
}
