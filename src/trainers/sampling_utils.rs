//! Sample rendering and contact-sheet utilities used at checkpoint time

use candle_core::{DType, Device, Tensor};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use rand::rngs::StdRng;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use crate::error::{FinetuneError, Result};
use crate::models::{DenoisingModel, PromptTokenizer, TextEncoderModel};
use crate::trainers::ddpm_scheduler::{sample_noise, PredictionType};

/// What to render for one row of the contact sheet.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub prompts: Vec<String>,
    pub negative_prompt: String,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
}

/// Turns the current networks into one image per prompt.
pub trait SampleRenderer {
    fn render(
        &self,
        unet: &dyn DenoisingModel,
        text_encoder: &dyn TextEncoderModel,
        request: &SampleRequest,
        rng: &mut StdRng,
    ) -> Result<Vec<RgbImage>>;
}

/// `{}` becomes the instance token; `//` separates prompts.
pub fn sample_prompts(template: &str, instance_token: &str) -> Vec<String> {
    template
        .replace("{}", instance_token)
        .split("//")
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// `[3, H, W]` in `[-1, 1]` to an RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (channel, height, width) = tensor.dims3()?;
    if channel != 3 {
        return Err(FinetuneError::Model(format!("expected 3 channels, got {}", channel)));
    }
    let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let data = tensor
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| FinetuneError::Model("failed to create image from tensor".to_string()))
}

/// Lays `images` out row-major on a `rows x cols` sheet.
pub fn image_grid(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.len() != rows * cols || images.is_empty() {
        return Err(FinetuneError::Model(format!(
            "{} images do not fill a {}x{} grid",
            images.len(),
            rows,
            cols
        )));
    }
    let (w, h) = images[0].dimensions();
    if images.iter().any(|img| img.dimensions() != (w, h)) {
        return Err(FinetuneError::Model("grid images differ in size".to_string()));
    }
    let mut grid = RgbImage::new(w * cols as u32, h * rows as u32);
    for (i, img) in images.iter().enumerate() {
        let x = (i % cols) as u32 * w;
        let y = (i / cols) as u32 * h;
        imageops::replace(&mut grid, img, x as i64, y as i64);
    }
    Ok(grid)
}

pub fn save_jpeg(img: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).map_err(|e| FinetuneError::persistence(path, e))?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    encoder.encode_image(img)?;
    Ok(())
}

/// Deterministic DDIM (eta = 0) sampler that previews the first three latent
/// channels as RGB instead of running a decoder.
pub struct LatentPreviewRenderer {
    tokenizer: Box<dyn PromptTokenizer + Send>,
    alphas_cumprod: Vec<f32>,
    prediction_type: PredictionType,
    latent_channels: usize,
    latent_size: usize,
    image_size: usize,
    device: Device,
}

impl LatentPreviewRenderer {
    pub fn new(
        tokenizer: Box<dyn PromptTokenizer + Send>,
        alphas_cumprod: Vec<f32>,
        prediction_type: PredictionType,
        latent_shape: (usize, usize),
        image_size: usize,
        device: Device,
    ) -> Self {
        let (latent_channels, latent_size) = latent_shape;
        Self {
            tokenizer,
            alphas_cumprod,
            prediction_type,
            latent_channels,
            latent_size,
            image_size,
            device,
        }
    }

    fn encode(&self, text_encoder: &dyn TextEncoderModel, prompt: &str) -> Result<Tensor> {
        let ids = self.tokenizer.encode_padded(prompt);
        let len = ids.len();
        let ids = Tensor::from_vec(ids, (1, len), &self.device)?;
        text_encoder.forward(&ids)
    }

    fn timesteps(&self, steps: usize) -> Vec<usize> {
        let n = self.alphas_cumprod.len();
        let steps = steps.clamp(1, n);
        (0..steps).rev().map(|i| i * n / steps).collect()
    }

    fn denoise(
        &self,
        unet: &dyn DenoisingModel,
        cond: &Tensor,
        uncond: &Tensor,
        request: &SampleRequest,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let shape = [1, self.latent_channels, self.latent_size, self.latent_size];
        let mut x = sample_noise(&shape, rng, &self.device)?;
        let timesteps = self.timesteps(request.num_inference_steps);

        for (i, &t) in timesteps.iter().enumerate() {
            let t_tensor = Tensor::new(&[t as i64], &self.device)?;
            let cond_out = unet.forward(&x, &t_tensor, cond)?.to_dtype(DType::F32)?;
            let out = if request.guidance_scale > 1.0 {
                let uncond_out = unet.forward(&x, &t_tensor, uncond)?.to_dtype(DType::F32)?;
                (&uncond_out + ((&cond_out - &uncond_out)? * request.guidance_scale)?)?
            } else {
                cond_out
            };

            let a_t = self.alphas_cumprod[t] as f64;
            let a_prev = timesteps
                .get(i + 1)
                .map(|&p| self.alphas_cumprod[p] as f64)
                .unwrap_or(1.0);
            let (eps, x0) = match self.prediction_type {
                PredictionType::Epsilon => {
                    let x0 = ((&x - (&out * (1.0 - a_t).sqrt())?)? / a_t.sqrt())?;
                    (out, x0)
                }
                PredictionType::VPrediction => {
                    let eps = ((&out * a_t.sqrt())? + (&x * (1.0 - a_t).sqrt())?)?;
                    let x0 = ((&x * a_t.sqrt())? - (&out * (1.0 - a_t).sqrt())?)?;
                    (eps, x0)
                }
            };
            x = ((x0 * a_prev.sqrt())? + (eps * (1.0 - a_prev).sqrt())?)?;
        }
        Ok(x)
    }

    fn preview(&self, latents: &Tensor) -> Result<Tensor> {
        let channels = latents.dim(1)?;
        let rgb = if channels >= 3 {
            latents.narrow(1, 0, 3)?
        } else {
            let first = latents.narrow(1, 0, 1)?;
            Tensor::cat(&[&first, &first, &first], 1)?
        };
        let rgb = rgb.tanh()?.upsample_nearest2d(self.image_size, self.image_size)?;
        Ok(rgb.squeeze(0)?)
    }
}

impl SampleRenderer for LatentPreviewRenderer {
    fn render(
        &self,
        unet: &dyn DenoisingModel,
        text_encoder: &dyn TextEncoderModel,
        request: &SampleRequest,
        rng: &mut StdRng,
    ) -> Result<Vec<RgbImage>> {
        let uncond = self.encode(text_encoder, &request.negative_prompt)?;
        let mut images = Vec::with_capacity(request.prompts.len());
        for prompt in &request.prompts {
            let cond = self.encode(text_encoder, prompt)?;
            let latents = self.denoise(unet, &cond, &uncond, request, rng)?;
            images.push(tensor_to_image(&self.preview(&latents)?)?);
        }
        Ok(images)
    }
}
