pub mod adam8bit;
pub mod checkpoint;
pub mod data;
pub mod ddpm_scheduler;
pub mod distributed;
pub mod ema;
pub mod gradient_accumulator;
pub mod loss;
pub mod lr_scheduler;
pub mod memory_utils;
pub mod metrics;
pub mod optimizer;
pub mod sampling_utils;
pub mod selection;
pub mod step_coordinator;

// Re-export key types
pub use adam8bit::Adam8bit;
pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointSnapshot};
pub use data::{BatchLayout, BatchSource, InMemoryLoader, TrainingBatch};
pub use ddpm_scheduler::{DDPMScheduler, NoiseSchedulerConfig, PredictionType};
pub use distributed::{LocalGroup, ProcessGroup, SingleProcess};
pub use ema::{EMATracker, EmaConfig};
pub use loss::{LossEngine, LossOutput};
pub use metrics::{JsonlSink, LogSink, MemorySink, Metrics, MetricsSink};
pub use selection::{select_trainable, SelectionSpec, TrainableParameterSet};
pub use step_coordinator::{CoordinatorState, Networks, StepCoordinator, TrainingSummary};

use candle_core::{DType, Device};
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FinetuneError, Result};
use crate::models::tiny::{TinyTextEncoderConfig, TinyUNetConfig};
use crate::models::{HashTokenizer, PromptTokenizer, TinyTextEncoder, TinyUNet, TinyVae};
use data::{build_examples, load_image_folder};
use sampling_utils::{sample_prompts, LatentPreviewRenderer};

pub const MIXED_PRECISION_KINDS: [&str; 3] = ["no", "fp16", "bf16"];
pub const BETA_SCHEDULES: [&str; 3] = ["linear", "scaled_linear", "squaredcos_cap_v2"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    /// Trainable selection of the denoising network.
    #[serde(default)]
    pub unet: SelectionSpec,
    /// Trainable selection of the text encoder.
    #[serde(default)]
    pub text_encoder: SelectionSpec,
    pub train: TrainConfig,
    #[serde(default)]
    pub prior: PriorConfig,
    #[serde(default)]
    pub ema: EmaSection,
    pub save: SaveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub pretrained_model_name_or_path: String,
    #[serde(default)]
    pub noise_scheduler: NoiseSchedulerConfig,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    #[serde(default = "default_instance_token")]
    pub instance_token: String,
    /// Registers the instance token as a new tokenizer entry.
    #[serde(default)]
    pub add_instance_token: bool,
    #[serde(default = "default_vae_downsample")]
    pub vae_downsample: usize,
    #[serde(default)]
    pub unet_arch: TinyUNetConfig,
    #[serde(default)]
    pub text_encoder_arch: TinyTextEncoderConfig,
}

fn default_resolution() -> u32 {
    64
}

fn default_instance_token() -> String {
    "sks".to_string()
}

fn default_vae_downsample() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub instance_data_dir: PathBuf,
    pub instance_prompt: String,
    pub seed: u64,
    pub train_batch_size: usize,
    pub num_train_epochs: usize,
    pub max_train_steps: Option<usize>,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    /// Defaults to `learning_rate` after scaling.
    pub learning_rate_text: Option<f64>,
    /// Multiplies the learning rate by accumulation, batch and world size.
    pub lr_scale: bool,
    pub lr_scheduler: String,
    pub lr_warmup_steps: usize,
    pub lr_num_cycles: f64,
    pub lr_power: f64,
    pub optimizer: String,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_weight_decay: f64,
    pub adam_epsilon: f64,
    /// Zero disables clipping.
    pub max_grad_norm: f64,
    pub mixed_precision: String,
    pub conditioning_dropout_prob: f32,
    pub unconditional_prompt: String,
    pub freeze_non_instance_embeddings: bool,
    /// In-process data-parallel workers.
    pub num_processes: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            instance_data_dir: PathBuf::new(),
            instance_prompt: String::new(),
            seed: 42,
            train_batch_size: 1,
            num_train_epochs: 1,
            max_train_steps: None,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-6,
            learning_rate_text: None,
            lr_scale: false,
            lr_scheduler: "constant".to_string(),
            lr_warmup_steps: 500,
            lr_num_cycles: 1.0,
            lr_power: 1.0,
            optimizer: "AdamW".to_string(),
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_weight_decay: 1e-2,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            mixed_precision: "no".to_string(),
            conditioning_dropout_prob: 0.0,
            unconditional_prompt: String::new(),
            freeze_non_instance_embeddings: false,
            num_processes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    pub with_prior_preservation: bool,
    pub class_data_dir: Option<PathBuf>,
    pub class_prompt: String,
    pub prior_loss_weight: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            with_prior_preservation: false,
            class_data_dir: None,
            class_prompt: String::new(),
            prior_loss_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmaSection {
    #[serde(default)]
    pub use_ema: bool,
    #[serde(flatten)]
    pub schedule: EmaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    pub save_interval: usize,
    pub save_min_steps: usize,
    pub save_n_sample: usize,
    /// `{}` is replaced by the instance token, `//` separates prompts.
    /// Defaults to the instance prompt.
    pub save_sample_prompt: Option<String>,
    pub save_sample_negative_prompt: String,
    pub save_guidance_scale: f64,
    pub save_infer_steps: usize,
    pub save_seed: Option<u64>,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            save_interval: 500,
            save_min_steps: 0,
            save_n_sample: 1,
            save_sample_prompt: None,
            save_sample_negative_prompt: String::new(),
            save_guidance_scale: 7.5,
            save_infer_steps: 50,
            save_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_every: usize,
    pub log_gpu: bool,
    /// Also append metrics to `<output_dir>/logs/metrics.jsonl`.
    pub metrics_jsonl: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_every: 1,
            log_gpu: false,
            metrics_jsonl: true,
        }
    }
}

impl Config {
    /// Rejects everything that would otherwise fail after compute started.
    pub fn validate(&self) -> Result<()> {
        let train = &self.train;
        if train.train_batch_size == 0 {
            return Err(FinetuneError::config("train_batch_size must be positive"));
        }
        if train.gradient_accumulation_steps == 0 {
            return Err(FinetuneError::config("gradient_accumulation_steps must be positive"));
        }
        if train.max_train_steps == Some(0) || (train.max_train_steps.is_none() && train.num_train_epochs == 0) {
            return Err(FinetuneError::config("nothing to train: zero steps or epochs"));
        }
        if train.num_processes == 0 {
            return Err(FinetuneError::config("num_processes must be positive"));
        }
        if train.learning_rate <= 0.0 || train.learning_rate_text.map_or(false, |lr| lr <= 0.0) {
            return Err(FinetuneError::config("learning rates must be positive"));
        }
        if !(0.0..=1.0).contains(&train.conditioning_dropout_prob) {
            return Err(FinetuneError::config(format!(
                "conditioning_dropout_prob {} outside [0, 1]",
                train.conditioning_dropout_prob
            )));
        }
        if !optimizer::OPTIMIZER_KINDS.contains(&train.optimizer.as_str()) {
            return Err(FinetuneError::config(format!(
                "Optimizer {} not supported yet.",
                train.optimizer
            )));
        }
        if !lr_scheduler::SCHEDULER_KINDS.contains(&train.lr_scheduler.as_str()) {
            return Err(FinetuneError::config(format!(
                "unknown lr scheduler {}",
                train.lr_scheduler
            )));
        }
        self.weight_dtype()?;

        let scheduler = &self.model.noise_scheduler;
        PredictionType::parse(&scheduler.prediction_type)?;
        if !BETA_SCHEDULES.contains(&scheduler.beta_schedule.as_str()) {
            return Err(FinetuneError::config(format!(
                "unknown beta schedule {}",
                scheduler.beta_schedule
            )));
        }
        if scheduler.num_train_timesteps == 0 {
            return Err(FinetuneError::config("num_train_timesteps must be positive"));
        }
        if self.model.unet_arch.context_dim != self.model.text_encoder_arch.hidden_size {
            return Err(FinetuneError::config(format!(
                "unet context_dim {} does not match text encoder hidden_size {}",
                self.model.unet_arch.context_dim, self.model.text_encoder_arch.hidden_size
            )));
        }
        let downsample = self.model.vae_downsample.max(1) as u32;
        if self.model.resolution == 0 || self.model.resolution % downsample != 0 {
            return Err(FinetuneError::config(format!(
                "resolution {} is not a positive multiple of {}",
                self.model.resolution, downsample
            )));
        }

        for (model, spec) in [("unet", &self.unet), ("text_encoder", &self.text_encoder)] {
            if spec.uses_adapters() && spec.lora_rank == 0 {
                return Err(FinetuneError::config(format!("{} adapter rank must be positive", model)));
            }
        }

        if self.prior.with_prior_preservation && self.prior.class_data_dir.is_none() {
            return Err(FinetuneError::config("prior preservation needs class_data_dir"));
        }
        self.ema.schedule.validate()?;

        if self.save.save_interval == 0 {
            return Err(FinetuneError::config("save_interval must be positive"));
        }
        if self.logging.log_every == 0 {
            return Err(FinetuneError::config("log_every must be positive"));
        }
        Ok(())
    }

    /// Storage dtype for frozen weights.
    pub fn weight_dtype(&self) -> Result<DType> {
        match self.train.mixed_precision.as_str() {
            "no" => Ok(DType::F32),
            "fp16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(FinetuneError::config(format!(
                "unknown mixed_precision {} (expected one of {})",
                other,
                MIXED_PRECISION_KINDS.join(", ")
            ))),
        }
    }

    pub fn sample_prompts(&self) -> Vec<String> {
        let template = self
            .save
            .save_sample_prompt
            .as_deref()
            .unwrap_or(&self.train.instance_prompt);
        sample_prompts(template, &self.model.instance_token)
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            output_dir: self.save.output_dir.clone(),
            pretrained_model: self.model.pretrained_model_name_or_path.clone(),
            save_n_sample: self.save.save_n_sample,
            sample_prompts: self.sample_prompts(),
            negative_prompt: self.save.save_sample_negative_prompt.clone(),
            guidance_scale: self.save.save_guidance_scale,
            num_inference_steps: self.save.save_infer_steps,
            sample_seed: self.save.save_seed.unwrap_or(self.train.seed),
        }
    }

    /// Log sink everywhere; the JSON-lines file only on the main process.
    pub fn metrics_sinks(&self, is_main_process: bool) -> Result<Vec<Box<dyn MetricsSink>>> {
        let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(LogSink::new(self.logging.log_every))];
        if is_main_process && self.logging.metrics_jsonl {
            let path = self.save.output_dir.join("logs").join("metrics.jsonl");
            sinks.push(Box::new(JsonlSink::create(&path)?));
        }
        Ok(sinks)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| FinetuneError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    Ok(config)
}

/// Builds the reference networks and data for one worker and sets up its
/// coordinator. Every rank derives identical initial weights from the seed.
pub fn build_coordinator(
    config: &Config,
    group: Arc<dyn ProcessGroup>,
    sinks: Vec<Box<dyn MetricsSink>>,
) -> Result<StepCoordinator> {
    config.validate()?;
    let device = Device::cuda_if_available(0)?;
    let mut rng = StdRng::seed_from_u64(config.train.seed);

    let text_arch = config.model.text_encoder_arch;
    let mut tokenizer = HashTokenizer::new(text_arch.vocab_size, text_arch.max_length)?;
    let instance_token_id = if config.model.add_instance_token {
        Some(tokenizer.add_token(&config.model.instance_token)?)
    } else {
        tokenizer.token_id(&config.model.instance_token)
    };

    let unet = TinyUNet::new(config.model.unet_arch, &mut rng, &device)?;
    let text_encoder = TinyTextEncoder::new(text_arch, &mut rng, &device)?;
    let latent_channels = config.model.unet_arch.latent_channels;
    let vae = TinyVae::new(latent_channels, config.model.vae_downsample, &mut rng, &device)?;
    let noise_scheduler = DDPMScheduler::new(&config.model.noise_scheduler, &device)?;

    let resolution = config.model.resolution;
    let instance_images = load_image_folder(&config.train.instance_data_dir, resolution, &device)?;
    let class_images = match (&config.prior.class_data_dir, config.prior.with_prior_preservation) {
        (Some(dir), true) => Some(load_image_folder(dir, resolution, &device)?),
        _ => None,
    };
    let examples = build_examples(
        &tokenizer,
        &instance_images,
        &config.train.instance_prompt,
        class_images
            .as_ref()
            .map(|images| (images.as_slice(), config.prior.class_prompt.as_str())),
    )?;
    let unconditional_ids = tokenizer.encode_padded(&config.train.unconditional_prompt);
    let loader = InMemoryLoader::new(
        examples,
        unconditional_ids,
        config.train.train_batch_size,
        config.train.seed,
        device.clone(),
    )?
    .sharded(group.rank(), group.world_size())?;

    let latent_size = resolution as usize / vae.downsample();
    let renderer = LatentPreviewRenderer::new(
        Box::new(tokenizer),
        noise_scheduler.alphas_cumprod().to_vec(),
        noise_scheduler.prediction_type(),
        (latent_channels, latent_size),
        resolution as usize,
        device,
    );
    let checkpoints = CheckpointManager::new(config.checkpoint_config(), Some(Box::new(renderer)));

    let networks = Networks {
        unet: Box::new(unet),
        text_encoder: Box::new(text_encoder),
        vae: Box::new(vae),
        noise_scheduler,
        instance_token_id,
    };
    StepCoordinator::setup(config, networks, Box::new(loader), group, checkpoints, sinks)
}

/// One worker's whole run. A failure releases the peers of a local group.
pub fn run_worker(config: &Config, group: Arc<dyn ProcessGroup>) -> Result<TrainingSummary> {
    let result = config
        .metrics_sinks(group.is_main_process())
        .and_then(|sinks| build_coordinator(config, group.clone(), sinks))
        .and_then(|mut coordinator| coordinator.run());
    if let Err(e) = &result {
        error!("Worker {} failed: {}", group.rank(), e);
        group.abort();
    }
    result
}

pub fn train_from_config(config_path: &Path) -> Result<TrainingSummary> {
    train(&load_config(config_path)?)
}

/// Runs `num_processes` workers (threads of this process when more than one)
/// and returns the main process's summary.
pub fn train(config: &Config) -> Result<TrainingSummary> {
    config.validate()?;

    let world_size = config.train.num_processes;
    if world_size == 1 {
        return run_worker(config, Arc::new(SingleProcess));
    }

    info!("Launching {} local workers", world_size);
    let groups = LocalGroup::new(world_size)?;
    std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| scope.spawn(move || run_worker(config, Arc::new(group))))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .join()
                    .map_err(|_| FinetuneError::Distributed("worker thread panicked".to_string()))?,
            );
        }
        // the main process's summary carries the checkpoints
        results
            .into_iter()
            .next()
            .ok_or_else(|| FinetuneError::Distributed("no workers ran".to_string()))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
model:
  pretrained_model_name_or_path: tiny
unet:
  module_or_class: [CrossAttention]
  lora_layer: [Linear]
train:
  instance_data_dir: data/instance
  instance_prompt: a photo of sks dog
save:
  output_dir: out
"#;

    fn minimal() -> Config {
        serde_yaml::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert_eq!(config.train.gradient_accumulation_steps, 1);
        assert_eq!(config.unet.lora_rank, 4);
        assert!(config.text_encoder.module_or_class.is_empty());
        assert!(!config.ema.use_ema);
        assert_eq!(config.ema.schedule.max_value, 0.9999);
        assert_eq!(config.weight_dtype().unwrap(), DType::F32);
        assert_eq!(config.sample_prompts(), vec!["a photo of sks dog"]);
        assert_eq!(config.checkpoint_config().sample_seed, 42);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = minimal();
        config.train.optimizer = "SGD".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Optimizer SGD not supported yet."));

        let mut config = minimal();
        config.train.mixed_precision = "fp8".to_string();
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = minimal();
        config.model.noise_scheduler.prediction_type = "sample".to_string();
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = minimal();
        config.train.conditioning_dropout_prob = 1.5;
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = minimal();
        config.ema.schedule.min_value = 0.9;
        config.ema.schedule.max_value = 0.5;
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = minimal();
        config.prior.with_prior_preservation = true;
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_ema_section_flattens() {
        let yaml = format!("{}ema:\n  use_ema: true\n  power: 0.5\n", MINIMAL);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.ema.use_ema);
        assert_eq!(config.ema.schedule.power, 0.5);
        assert_eq!(config.ema.schedule.inv_gamma, 1.0);
    }

    #[test]
    fn test_load_config_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        fs::write(&path, MINIMAL)?;
        let config = load_config(&path)?;
        assert_eq!(config.save.output_dir, PathBuf::from("out"));
        assert!(load_config(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
