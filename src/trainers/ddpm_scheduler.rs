//! DDPM noise scheduler for diffusion training
//! Forward-process noising, velocity targets and timestep sampling

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};

/// What the denoiser is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionType {
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "v_prediction")]
    VPrediction,
}

impl PredictionType {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            other => Err(FinetuneError::config(format!("Unknown prediction type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f32,
    pub beta_end: f32,
    pub beta_schedule: String,
    pub prediction_type: String,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            prediction_type: "epsilon".to_string(),
        }
    }
}

pub struct DDPMScheduler {
    num_timesteps: usize,
    prediction_type: PredictionType,
    alphas_cumprod: Vec<f32>,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(config: &NoiseSchedulerConfig, device: &Device) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            return Err(FinetuneError::config("num_train_timesteps must be at least 2"));
        }
        let betas = match config.beta_schedule.as_str() {
            "linear" => Self::linear_beta_schedule(n, config.beta_start, config.beta_end),
            "scaled_linear" => Self::scaled_linear_beta_schedule(n, config.beta_start, config.beta_end),
            "squaredcos_cap_v2" => Self::cosine_beta_schedule(n),
            other => {
                return Err(FinetuneError::config(format!(
                    "unknown beta schedule {}",
                    other
                )))
            }
        };
        let prediction_type = PredictionType::parse(&config.prediction_type)?;

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0f32;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }

        let sqrt_a: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_1ma: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_timesteps: n,
            prediction_type,
            alphas_cumprod,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_a, n, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_1ma, n, device)?,
        })
    }

    /// `[B]` coefficients gathered at `timesteps`, shaped to broadcast over `like`.
    fn gather(&self, table: &Tensor, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        let batch_size = timesteps.dim(0)?;
        let mut shape = vec![batch_size];
        shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));
        let timesteps = timesteps.to_dtype(DType::I64)?;
        Ok(table
            .index_select(&timesteps, 0)?
            .reshape(shape)?
            .to_dtype(like.dtype())?)
    }

    /// noisy = sqrt(a_t) * original + sqrt(1 - a_t) * noise
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha_prod = self.gather(&self.sqrt_alphas_cumprod, timesteps, original_samples)?;
        let sqrt_one_minus_alpha_prod =
            self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, original_samples)?;
        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// v = sqrt(a_t) * noise - sqrt(1 - a_t) * sample
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha_prod = self.gather(&self.sqrt_alphas_cumprod, timesteps, sample)?;
        let sqrt_one_minus_alpha_prod =
            self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, sample)?;
        Ok((sqrt_alpha_prod.broadcast_mul(noise)? - sqrt_one_minus_alpha_prod.broadcast_mul(sample)?)?)
    }

    /// Loss target for the configured prediction type.
    pub fn target(&self, latents: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        match self.prediction_type {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => self.get_velocity(latents, noise, timesteps),
        }
    }

    /// Uniform integer timesteps in `[0, num_train_timesteps)`.
    pub fn sample_timesteps(&self, batch_size: usize, rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
        let timesteps: Vec<i64> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as i64)
            .collect();
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    fn linear_beta_schedule(n: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        (0..n)
            .map(|i| beta_start + (beta_end - beta_start) * (i as f32) / (n as f32 - 1.0))
            .collect()
    }

    fn scaled_linear_beta_schedule(n: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        (0..n)
            .map(|i| {
                let t = start + (end - start) * (i as f32) / (n as f32 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_beta_schedule(n: usize) -> Vec<f32> {
        let s = 0.008;
        let alpha_bar = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);
        (0..n)
            .map(|i| {
                let t1 = i as f32 / n as f32;
                let t2 = (i + 1) as f32 / n as f32;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }
}

/// Standard normal tensor drawn from a seeded generator, F32.
pub fn sample_noise(shape: &[usize], rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scheduler(schedule: &str, prediction: &str) -> DDPMScheduler {
        let config = NoiseSchedulerConfig {
            beta_schedule: schedule.to_string(),
            prediction_type: prediction.to_string(),
            ..Default::default()
        };
        DDPMScheduler::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_alphas_cumprod_decrease() {
        for schedule in ["linear", "scaled_linear", "squaredcos_cap_v2"] {
            let s = scheduler(schedule, "epsilon");
            let a = s.alphas_cumprod();
            assert_eq!(a.len(), 1000);
            assert!(a.windows(2).all(|w| w[1] < w[0]), "{} not decreasing", schedule);
            assert!(a[0] < 1.0 && a[999] > 0.0);
        }
    }

    #[test]
    fn test_unknown_kinds_rejected() {
        let bad_schedule = NoiseSchedulerConfig {
            beta_schedule: "exotic".into(),
            ..Default::default()
        };
        assert!(DDPMScheduler::new(&bad_schedule, &Device::Cpu)
            .err()
            .map(|e| e.is_configuration())
            .unwrap_or(false));
        assert!(PredictionType::parse("sample").unwrap_err().is_configuration());
    }

    #[test]
    fn test_add_noise_and_velocity() -> Result<()> {
        let device = Device::Cpu;
        let s = scheduler("scaled_linear", "v_prediction");
        let latents = Tensor::ones((2, 1, 1, 1), DType::F32, &device)?;
        let noise = Tensor::zeros((2, 1, 1, 1), DType::F32, &device)?;
        let t = Tensor::new(&[0i64, 999], &device)?;

        let noisy = s.add_noise(&latents, &noise, &t)?.flatten_all()?.to_vec1::<f32>()?;
        let a = s.alphas_cumprod();
        assert!((noisy[0] - a[0].sqrt()).abs() < 1e-6);
        assert!((noisy[1] - a[999].sqrt()).abs() < 1e-6);

        let v = s.target(&latents, &noise, &t)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((v[1] + (1.0 - a[999]).sqrt()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() -> Result<()> {
        let s = scheduler("linear", "epsilon");
        let device = Device::Cpu;
        let draw = |seed| -> Result<(Vec<i64>, Vec<f32>)> {
            let mut rng = StdRng::seed_from_u64(seed);
            let t = s.sample_timesteps(4, &mut rng, &device)?.to_vec1::<i64>()?;
            let n = sample_noise(&[4], &mut rng, &device)?.to_vec1::<f32>()?;
            Ok((t, n))
        };
        assert_eq!(draw(3)?, draw(3)?);
        assert!(draw(3)?.0.iter().all(|&t| (0..1000).contains(&t)));
        Ok(())
    }
}
