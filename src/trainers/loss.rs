//! Denoising objective with optional prior preservation
//!
//! The batch carries explicit instance and prior counts; instance examples
//! always come first.

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::error::{FinetuneError, Result};
use crate::trainers::data::{BatchLayout, TrainingBatch};

/// Scalar losses of one micro-batch, all F32.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub pred_loss: Tensor,
    pub prior_loss: Option<Tensor>,
}

/// Host-side copy of the loss components for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossComponents {
    pub pred: f32,
    pub prior: Option<f32>,
    pub total: f32,
}

impl LossOutput {
    pub fn components(&self) -> Result<LossComponents> {
        let prior = match &self.prior_loss {
            Some(p) => Some(p.to_scalar::<f32>()?),
            None => None,
        };
        Ok(LossComponents {
            pred: self.pred_loss.to_scalar::<f32>()?,
            prior,
            total: self.loss.to_scalar::<f32>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LossEngine {
    prior_loss_weight: f64,
}

fn mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.sqr()?.mean_all()?)
}

impl LossEngine {
    pub fn new(prior_loss_weight: f64) -> Self {
        Self { prior_loss_weight }
    }

    pub fn prior_loss_weight(&self) -> f64 {
        self.prior_loss_weight
    }

    /// Without prior examples the loss is the plain mean squared error over
    /// every element. With them, `loss = pred_loss + w * prior_loss` where
    /// `pred_loss` averages per-example errors of the instance slice and
    /// `prior_loss` is the element mean over the prior slice.
    pub fn compute(&self, model_pred: &Tensor, target: &Tensor, layout: &BatchLayout) -> Result<LossOutput> {
        if model_pred.dims() != target.dims() {
            return Err(FinetuneError::Model(format!(
                "prediction {:?} and target {:?} differ in shape",
                model_pred.dims(),
                target.dims()
            )));
        }
        let batch = model_pred.dim(0)?;
        if batch != layout.total() {
            return Err(FinetuneError::Model(format!(
                "batch of {} does not match {} instance + {} prior examples",
                batch, layout.instance_count, layout.prior_count
            )));
        }

        let pred = model_pred.to_dtype(DType::F32)?;
        let target = target.to_dtype(DType::F32)?;

        if layout.prior_count == 0 {
            let loss = mse(&pred, &target)?;
            return Ok(LossOutput {
                pred_loss: loss.clone(),
                loss,
                prior_loss: None,
            });
        }

        let n = layout.instance_count;
        let instance_pred = pred.narrow(0, 0, n)?;
        let instance_target = target.narrow(0, 0, n)?;
        let prior_pred = pred.narrow(0, n, layout.prior_count)?;
        let prior_target = target.narrow(0, n, layout.prior_count)?;

        let pred_loss = (instance_pred - instance_target)?
            .sqr()?
            .flatten_from(1)?
            .mean(1)?
            .mean_all()?;
        let prior_loss = mse(&prior_pred, &prior_target)?;
        let loss = (&pred_loss + (&prior_loss * self.prior_loss_weight)?)?;

        Ok(LossOutput {
            loss,
            pred_loss,
            prior_loss: Some(prior_loss),
        })
    }
}

/// Replaces the conditioning of each example with the unconditional prompt
/// with probability `p`. Instance example `i` and prior example `i` share one
/// draw. Returns the new batch and the number of replaced rows.
pub fn apply_conditioning_dropout(
    batch: &TrainingBatch,
    p: f32,
    rng: &mut impl Rng,
) -> Result<(TrainingBatch, usize)> {
    if p <= 0.0 {
        return Ok((batch.clone(), 0));
    }

    let layout = batch.layout;
    let mut rows = batch.input_ids.to_vec2::<u32>()?;
    let unconditional = &batch.unconditional_ids;
    if unconditional.len() != rows.first().map(Vec::len).unwrap_or(0) {
        return Err(FinetuneError::Model(
            "unconditional prompt length differs from batch sequence length".to_string(),
        ));
    }

    let paired = layout.instance_count.max(layout.prior_count);
    let mut replaced = 0;
    for i in 0..paired {
        if rng.gen::<f32>() >= p {
            continue;
        }
        if i < layout.instance_count {
            rows[i].clone_from(unconditional);
            replaced += 1;
        }
        if i < layout.prior_count {
            rows[layout.instance_count + i].clone_from(unconditional);
            replaced += 1;
        }
    }

    let (n_rows, seq_len) = batch.input_ids.dims2()?;
    let flat: Vec<u32> = rows.into_iter().flatten().collect();
    let input_ids = Tensor::from_vec(flat, (n_rows, seq_len), batch.input_ids.device())?;
    Ok((
        TrainingBatch {
            input_ids,
            ..batch.clone()
        },
        replaced,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tensors(batch: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let n = batch * 2 * 2 * 2;
        let pred: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
        let target: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).cos()).collect();
        (
            Tensor::from_vec(pred, (batch, 2, 2, 2), &device).unwrap(),
            Tensor::from_vec(target, (batch, 2, 2, 2), &device).unwrap(),
        )
    }

    #[test]
    fn test_plain_mse_without_prior() -> Result<()> {
        let (pred, target) = tensors(3);
        let out = LossEngine::new(1.0).compute(&pred, &target, &BatchLayout::instance_only(3))?;
        let p = pred.flatten_all()?.to_vec1::<f32>()?;
        let t = target.flatten_all()?.to_vec1::<f32>()?;
        let expected = p.iter().zip(&t).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / p.len() as f32;
        let c = out.components()?;
        assert!((c.total - expected).abs() < 1e-6);
        assert_eq!(c.prior, None);
        Ok(())
    }

    #[test]
    fn test_prior_weighting_is_exact() -> Result<()> {
        let (pred, target) = tensors(4);
        let layout = BatchLayout {
            instance_count: 2,
            prior_count: 2,
        };
        for weight in [0.0f64, 1.0, 2.5] {
            let c = LossEngine::new(weight).compute(&pred, &target, &layout)?.components()?;
            let prior = c.prior.unwrap_or(f32::NAN);
            let expected = c.pred + weight as f32 * prior;
            assert!((c.total - expected).abs() <= 1e-6 * expected.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let (pred, target) = tensors(3);
        let layout = BatchLayout {
            instance_count: 1,
            prior_count: 1,
        };
        assert!(LossEngine::new(1.0).compute(&pred, &target, &layout).is_err());
    }

    fn batch() -> TrainingBatch {
        let device = Device::Cpu;
        let ids = Tensor::new(
            &[[1u32, 7, 9, 2], [1, 8, 9, 2], [1, 5, 6, 2], [1, 4, 6, 2]],
            &device,
        )
        .unwrap();
        TrainingBatch {
            input_ids: ids,
            pixel_values: Tensor::zeros((4, 3, 2, 2), DType::F32, &device).unwrap(),
            layout: BatchLayout {
                instance_count: 2,
                prior_count: 2,
            },
            unconditional_ids: vec![1, 2, 0, 0],
        }
    }

    #[test]
    fn test_dropout_extremes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let original = batch();

        let (kept, n) = apply_conditioning_dropout(&original, 0.0, &mut rng)?;
        assert_eq!(n, 0);
        assert_eq!(kept.input_ids.to_vec2::<u32>()?, original.input_ids.to_vec2::<u32>()?);

        let (dropped, n) = apply_conditioning_dropout(&original, 1.0, &mut rng)?;
        assert_eq!(n, 4);
        assert!(dropped
            .input_ids
            .to_vec2::<u32>()?
            .iter()
            .all(|row| row == &original.unconditional_ids));
        Ok(())
    }

    #[test]
    fn test_dropout_pairs_instance_and_prior() -> Result<()> {
        let original = batch();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (out, _) = apply_conditioning_dropout(&original, 0.5, &mut rng)?;
            let rows = out.input_ids.to_vec2::<u32>()?;
            for i in 0..2 {
                let instance_dropped = rows[i] == original.unconditional_ids;
                let prior_dropped = rows[2 + i] == original.unconditional_ids;
                assert_eq!(instance_dropped, prior_dropped);
            }
        }
        Ok(())
    }
}
