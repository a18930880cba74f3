//! The epoch / micro-batch training loop
//!
//! One coordinator runs per worker. It owns the step counters, the optimizer
//! state of both models and the EMA shadow. Workers stay in lockstep because
//! they all see the same number of batches and synchronize gradients at
//! every accumulation boundary.

use candle_core::{DType, Tensor, Var};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{FinetuneError, Result};
use crate::models::{DenoisingModel, ImageEncoder, TextEncoderModel};
use crate::trainers::checkpoint::{CheckpointManager, CheckpointSnapshot};
use crate::trainers::data::{BatchSource, TrainingBatch};
use crate::trainers::ddpm_scheduler::{sample_noise, DDPMScheduler};
use crate::trainers::distributed::ProcessGroup;
use crate::trainers::ema::EMATracker;
use crate::trainers::gradient_accumulator::{clip_grad_norm, GradientAccumulator};
use crate::trainers::loss::{apply_conditioning_dropout, LossComponents, LossEngine};
use crate::trainers::lr_scheduler::{create_scheduler, LRScheduler, SchedulerOptions};
use crate::trainers::memory_utils::gpu_memory_used_mb;
use crate::trainers::metrics::{Metrics, MetricsSink};
use crate::trainers::optimizer::{create_optimizer, AdamParams, Optimizer};
use crate::trainers::selection::{select_trainable, TrainableParameterSet};
use crate::trainers::Config;

/// Where the coordinator is inside one accumulation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Accumulating,
    Synced,
    CheckpointDue,
    Completed,
}

/// Pretrained collaborators handed to the coordinator.
pub struct Networks {
    pub unet: Box<dyn DenoisingModel + Send>,
    pub text_encoder: Box<dyn TextEncoderModel + Send>,
    pub vae: Box<dyn ImageEncoder + Send>,
    pub noise_scheduler: DDPMScheduler,
    /// Token whose embedding row stays trainable under the embedding guard.
    pub instance_token_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub micro_steps: usize,
    pub epochs: usize,
    pub checkpoints: Vec<CheckpointSnapshot>,
}

struct ParamGroup {
    /// Trainable variables keyed `<model>.<param>`.
    params: Vec<(String, Var)>,
    base_lr: f64,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LRScheduler>,
}

impl ParamGroup {
    fn new(set: &TrainableParameterSet, config: &Config, total_steps: usize) -> Result<Self> {
        let train = &config.train;
        let params = set
            .vars()
            .iter()
            .map(|(name, var)| (format!("{}.{}", set.model(), name), var.clone()))
            .collect();
        let optimizer = create_optimizer(
            &train.optimizer,
            AdamParams {
                lr: set.learning_rate(),
                beta1: train.adam_beta1,
                beta2: train.adam_beta2,
                eps: train.adam_epsilon,
                weight_decay: train.adam_weight_decay,
            },
        )?;
        let scheduler = create_scheduler(
            &train.lr_scheduler,
            &SchedulerOptions {
                warmup_steps: train.lr_warmup_steps,
                total_steps,
                num_cycles: train.lr_num_cycles,
                power: train.lr_power,
                base_lr: set.learning_rate(),
            },
        )?;
        Ok(Self {
            params,
            base_lr: set.learning_rate(),
            optimizer,
            scheduler,
        })
    }

    /// Applies the scheduled rate for optimizer step `step` and updates.
    fn step(&mut self, step: usize, grads: &HashMap<String, Tensor>) -> Result<f64> {
        let lr = self.scheduler.get_lr(self.base_lr, step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&self.params, grads)?;
        Ok(lr)
    }
}

/// Restores every token-embedding row except the instance token's after each
/// optimizer step.
struct EmbeddingGuard {
    var: Var,
    original: Tensor,
    keep: Tensor,
}

impl EmbeddingGuard {
    fn new(var: Var, token_id: u32) -> Result<Self> {
        let rows = var.dim(0)?;
        if token_id as usize >= rows {
            return Err(FinetuneError::config(format!(
                "instance token id {} outside an embedding of {} rows",
                token_id, rows
            )));
        }
        let mut mask = vec![0f32; rows];
        mask[token_id as usize] = 1.0;
        let keep = Tensor::from_vec(mask, (rows, 1), var.device())?.to_dtype(var.dtype())?;
        Ok(Self {
            original: var.as_tensor().copy()?,
            var,
            keep,
        })
    }

    fn restore(&self) -> Result<()> {
        let current = self.var.as_tensor().detach();
        let restored = (self.original.broadcast_mul(&(1.0 - &self.keep)?)?
            + current.broadcast_mul(&self.keep)?)?;
        self.var.set(&restored)?;
        Ok(())
    }
}

pub struct StepCoordinator {
    config: Config,
    unet: Box<dyn DenoisingModel + Send>,
    text_encoder: Box<dyn TextEncoderModel + Send>,
    vae: Box<dyn ImageEncoder + Send>,
    noise_scheduler: DDPMScheduler,
    unet_set: TrainableParameterSet,
    text_set: TrainableParameterSet,
    unet_group: Option<ParamGroup>,
    text_group: Option<ParamGroup>,
    loss_engine: LossEngine,
    accumulator: GradientAccumulator,
    ema: Option<EMATracker>,
    guard: Option<EmbeddingGuard>,
    data: Box<dyn BatchSource + Send>,
    group: Arc<dyn ProcessGroup>,
    checkpoints: CheckpointManager,
    sinks: Vec<Box<dyn MetricsSink>>,
    rng: StdRng,
    state: CoordinatorState,
    global_step: usize,
    micro_steps: usize,
    num_update_steps_per_epoch: usize,
    max_train_steps: usize,
    num_train_epochs: usize,
    pending_losses: Vec<LossComponents>,
    last_saved_step: Option<usize>,
    snapshots: Vec<CheckpointSnapshot>,
}

impl StepCoordinator {
    /// Carves the trainable sets, builds optimizers and schedulers and casts
    /// frozen weights. Fails before any step runs when nothing trains.
    pub fn setup(
        config: &Config,
        networks: Networks,
        data: Box<dyn BatchSource + Send>,
        group: Arc<dyn ProcessGroup>,
        checkpoints: CheckpointManager,
        sinks: Vec<Box<dyn MetricsSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut config = config.clone();
        let Networks {
            mut unet,
            mut text_encoder,
            mut vae,
            noise_scheduler,
            instance_token_id,
        } = networks;
        let train = &config.train;
        let world_size = group.world_size();

        let mut learning_rate = train.learning_rate;
        if train.lr_scale {
            learning_rate *= (train.gradient_accumulation_steps * train.train_batch_size * world_size) as f64;
        }
        let learning_rate_text = train.learning_rate_text.unwrap_or(learning_rate);

        // identical on every rank so adapters start from the same weights
        let mut init_rng = StdRng::seed_from_u64(train.seed);
        let unet_name = unet.name().to_string();
        let (graph, unet_set) = select_trainable(
            &unet_name,
            std::mem::take(unet.layers_mut()),
            &config.unet,
            learning_rate,
            &mut init_rng,
        )?;
        *unet.layers_mut() = graph;
        let text_name = text_encoder.name().to_string();
        let (graph, text_set) = select_trainable(
            &text_name,
            std::mem::take(text_encoder.layers_mut()),
            &config.text_encoder,
            learning_rate_text,
            &mut init_rng,
        )?;
        *text_encoder.layers_mut() = graph;

        if !unet_set.has_any_trainable() && !text_set.has_any_trainable() {
            return Err(FinetuneError::config("This configuration does not train anything."));
        }

        let weight_dtype = config.weight_dtype()?;
        vae.cast(weight_dtype)?;
        if weight_dtype != DType::F32 {
            let graph = std::mem::take(unet.layers_mut());
            *unet.layers_mut() = graph.cast_frozen(weight_dtype)?;
            let graph = std::mem::take(text_encoder.layers_mut());
            *text_encoder.layers_mut() = graph.cast_frozen(weight_dtype)?;
        }

        if data.num_batches() == 0 {
            return Err(FinetuneError::config("data source yields no batches"));
        }
        let accumulation = train.gradient_accumulation_steps;
        let num_update_steps_per_epoch = (data.num_batches() + accumulation - 1) / accumulation;
        let max_train_steps = train
            .max_train_steps
            .unwrap_or(train.num_train_epochs * num_update_steps_per_epoch);
        let num_train_epochs = (max_train_steps + num_update_steps_per_epoch - 1) / num_update_steps_per_epoch;

        let unet_group = match unet_set.has_any_trainable() {
            true => Some(ParamGroup::new(&unet_set, &config, max_train_steps)?),
            false => None,
        };
        let text_group = match text_set.has_any_trainable() {
            true => Some(ParamGroup::new(&text_set, &config, max_train_steps)?),
            false => None,
        };

        let ema = if config.ema.use_ema {
            if unet_set.has_any_trainable() {
                Some(EMATracker::new(config.ema.schedule, unet.layers())?)
            } else {
                warn!("use_ema is set but the {} trains nothing; EMA disabled", unet.name());
                None
            }
        } else {
            None
        };

        let guard = if train.freeze_non_instance_embeddings {
            Self::embedding_guard(&*text_encoder, instance_token_id)?
        } else {
            None
        };

        let noise_seed = train.seed.wrapping_add(1 + group.rank() as u64);
        let loss_engine = LossEngine::new(if config.prior.with_prior_preservation {
            config.prior.prior_loss_weight
        } else {
            0.0
        });

        config.train.learning_rate = learning_rate;
        config.train.learning_rate_text = Some(learning_rate_text);
        config.train.max_train_steps = Some(max_train_steps);
        config.train.num_train_epochs = num_train_epochs;

        if group.is_main_process() {
            let output_dir = &checkpoints.config().output_dir;
            fs::create_dir_all(output_dir).map_err(|e| FinetuneError::persistence(output_dir, e))?;
            let args_path = output_dir.join("args.yaml");
            fs::write(&args_path, serde_yaml::to_string(&config)?)
                .map_err(|e| FinetuneError::persistence(&args_path, e))?;

            let per_device = config.train.train_batch_size;
            info!("***** Running training *****");
            info!("  Num examples = {}", data.num_examples());
            info!("  Num batches each epoch = {}", data.num_batches());
            info!("  Num Epochs = {}", num_train_epochs);
            info!("  Instantaneous batch size per device = {}", per_device);
            info!(
                "  Total train batch size (w. parallel, distributed & accumulation) = {}",
                per_device * world_size * accumulation
            );
            info!("  Gradient Accumulation steps = {}", accumulation);
            info!("  Total optimization steps = {}", max_train_steps);
            for set in [&unet_set, &text_set] {
                info!("  Trainable {} parameters = {}", set.model(), set.num_trainable_elements());
            }
        }

        Ok(Self {
            accumulator: GradientAccumulator::new(accumulation),
            config,
            unet,
            text_encoder,
            vae,
            noise_scheduler,
            unet_set,
            text_set,
            unet_group,
            text_group,
            loss_engine,
            ema,
            guard,
            data,
            group,
            checkpoints,
            sinks,
            rng: StdRng::seed_from_u64(noise_seed),
            state: CoordinatorState::Idle,
            global_step: 0,
            micro_steps: 0,
            num_update_steps_per_epoch,
            max_train_steps,
            num_train_epochs,
            pending_losses: Vec::new(),
            last_saved_step: None,
            snapshots: Vec::new(),
        })
    }

    fn embedding_guard(
        text_encoder: &dyn TextEncoderModel,
        instance_token_id: Option<u32>,
    ) -> Result<Option<EmbeddingGuard>> {
        let (Some(path), Some(token_id)) = (text_encoder.token_embedding_path(), instance_token_id) else {
            warn!("freeze_non_instance_embeddings needs a token embedding and an instance token; ignored");
            return Ok(None);
        };
        let weight = format!("{}.weight", path);
        match text_encoder
            .layers()
            .trainable_vars()
            .into_iter()
            .find(|(name, _)| *name == weight)
        {
            Some((_, var)) => Ok(Some(EmbeddingGuard::new(var, token_id)?)),
            None => Ok(None),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn max_train_steps(&self) -> usize {
        self.max_train_steps
    }

    pub fn num_train_epochs(&self) -> usize {
        self.num_train_epochs
    }

    pub fn num_update_steps_per_epoch(&self) -> usize {
        self.num_update_steps_per_epoch
    }

    pub fn unet(&self) -> &dyn DenoisingModel {
        self.unet.as_ref()
    }

    pub fn text_encoder(&self) -> &dyn TextEncoderModel {
        self.text_encoder.as_ref()
    }

    pub fn unet_set(&self) -> &TrainableParameterSet {
        &self.unet_set
    }

    pub fn text_set(&self) -> &TrainableParameterSet {
        &self.text_set
    }

    pub fn ema(&self) -> Option<&EMATracker> {
        self.ema.as_ref()
    }

    /// Runs every epoch until `max_train_steps` synchronized steps are done.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        #[cfg(feature = "progress-bar")]
        let progress = self.progress_bar();

        let mut epochs_run = 0;
        for epoch in 0..self.num_train_epochs {
            epochs_run = epoch + 1;
            let batches = self.data.epoch_batches(epoch)?;
            for batch in &batches {
                self.state = CoordinatorState::Accumulating;
                let components = self.micro_step(batch)?;
                self.pending_losses.push(components);
                self.micro_steps += 1;

                if self.accumulator.record_micro_step() {
                    self.synchronized_step()?;
                    #[cfg(feature = "progress-bar")]
                    self.update_progress(&progress);
                }
                if self.global_step >= self.max_train_steps {
                    break;
                }
            }

            // a trailing partial group still counts as one optimizer step
            if self.accumulator.pending() > 0 && self.global_step < self.max_train_steps {
                self.synchronized_step()?;
                #[cfg(feature = "progress-bar")]
                self.update_progress(&progress);
            }

            self.group.barrier()?;
            if self.global_step >= self.max_train_steps {
                break;
            }
        }

        if self.group.is_main_process() && self.last_saved_step != Some(self.global_step) {
            self.checkpoint()?;
        }
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        self.group.barrier()?;

        #[cfg(feature = "progress-bar")]
        Self::finish_progress(&progress);

        self.state = CoordinatorState::Completed;
        info!(
            "Training finished after {} steps ({} micro-batches, {} epochs)",
            self.global_step, self.micro_steps, epochs_run
        );
        Ok(TrainingSummary {
            global_step: self.global_step,
            micro_steps: self.micro_steps,
            epochs: epochs_run,
            checkpoints: self.snapshots.clone(),
        })
    }

    /// Forward, loss and backward for one micro-batch. Gradients land in the
    /// accumulator; no weight changes here.
    fn micro_step(&mut self, batch: &TrainingBatch) -> Result<LossComponents> {
        let (batch, _) =
            apply_conditioning_dropout(batch, self.config.train.conditioning_dropout_prob, &mut self.rng)?;
        let device = batch.pixel_values.device().clone();

        let pixels = batch.pixel_values.to_dtype(self.vae.dtype())?;
        let latents = (self.vae.encode(&pixels)?.to_dtype(DType::F32)? * self.vae.scaling_factor())?.detach();
        let bsz = latents.dim(0)?;

        let noise = sample_noise(latents.dims(), &mut self.rng, &device)?;
        let timesteps = self.noise_scheduler.sample_timesteps(bsz, &mut self.rng, &device)?;
        let noisy_latents = self.noise_scheduler.add_noise(&latents, &noise, &timesteps)?;

        let encoder_hidden_states = self.text_encoder.forward(&batch.input_ids)?;
        let encoder_hidden_states = if self.text_set.has_any_trainable() {
            encoder_hidden_states
        } else {
            encoder_hidden_states.detach()
        };

        let model_pred = self
            .unet
            .forward(&noisy_latents, &timesteps, &encoder_hidden_states)?;
        let target = self.noise_scheduler.target(&latents, &noise, &timesteps)?;

        let output = self.loss_engine.compute(&model_pred, &target, &batch.layout)?;
        let components = output.components()?;
        if !components.total.is_finite() {
            return Err(FinetuneError::NumericDivergence {
                step: self.global_step,
                value: components.total,
            });
        }

        let scaled = (&output.loss / self.accumulator.steps() as f64)?;
        let grads = scaled.backward()?;
        for group in [&self.unet_group, &self.text_group].into_iter().flatten() {
            self.accumulator.accumulate_store(&group.params, &grads)?;
        }
        Ok(components)
    }

    /// The accumulation boundary: the only place weights change and
    /// `global_step` advances.
    fn synchronized_step(&mut self) -> Result<()> {
        let grads = self.accumulator.get_and_reset();
        let mut grads = self.group.all_reduce_mean(grads)?;
        if self.config.train.max_grad_norm > 0.0 {
            clip_grad_norm(&mut grads, self.config.train.max_grad_norm)?;
        }

        let step = self.global_step;
        let unet_lr = match self.unet_group.as_mut() {
            Some(group) => Some(group.step(step, &grads)?),
            None => None,
        };
        let text_lr = match self.text_group.as_mut() {
            Some(group) => Some(group.step(step, &grads)?),
            None => None,
        };

        if let Some(ema) = self.ema.as_mut() {
            ema.step(self.unet.layers())?;
        }
        if let Some(guard) = &self.guard {
            guard.restore()?;
        }

        self.global_step += 1;
        self.state = CoordinatorState::Synced;

        if self.group.is_main_process() {
            let metrics = self.step_metrics(unet_lr, text_lr);
            for sink in self.sinks.iter_mut() {
                sink.log(self.global_step, &metrics)?;
            }
        }
        self.pending_losses.clear();

        let save = &self.config.save;
        if self.global_step % save.save_interval == 0 && self.global_step >= save.save_min_steps {
            self.state = CoordinatorState::CheckpointDue;
            self.group.barrier()?;
            if self.group.is_main_process() {
                self.checkpoint()?;
            }
            // record on every rank so no worker repeats the final save
            self.last_saved_step = Some(self.global_step);
        }
        self.state = CoordinatorState::Idle;
        Ok(())
    }

    fn step_metrics(&self, unet_lr: Option<f64>, text_lr: Option<f64>) -> Metrics {
        let mut metrics = Metrics::new();
        let n = self.pending_losses.len().max(1) as f64;
        let mean = |f: &dyn Fn(&LossComponents) -> f64| self.pending_losses.iter().map(f).sum::<f64>() / n;

        let has_prior = self.pending_losses.iter().any(|c| c.prior.is_some());
        if has_prior {
            metrics.insert("Loss/pred".to_string(), mean(&|c| c.pred as f64));
            metrics.insert("Loss/prior".to_string(), mean(&|c| c.prior.unwrap_or(0.0) as f64));
            metrics.insert("Loss/total".to_string(), mean(&|c| c.total as f64));
        } else {
            metrics.insert("Loss/pred".to_string(), mean(&|c| c.total as f64));
        }

        match (unet_lr, text_lr) {
            (Some(u), Some(t)) => {
                metrics.insert("lr/unet".to_string(), u);
                metrics.insert("lr/text".to_string(), t);
            }
            (Some(lr), None) | (None, Some(lr)) => {
                metrics.insert("lr".to_string(), lr);
            }
            (None, None) => {}
        }

        if self.config.logging.log_gpu {
            if let Some(used) = gpu_memory_used_mb().first() {
                metrics.insert("GPU".to_string(), *used);
            }
        }
        if let Some(ema) = &self.ema {
            metrics.insert("ema_decay".to_string(), ema.decay());
        }
        metrics
    }

    fn checkpoint(&mut self) -> Result<()> {
        let snapshot = self.checkpoints.save(
            self.global_step,
            self.unet.as_mut(),
            self.text_encoder.as_mut(),
            &self.unet_set,
            &self.text_set,
            self.ema.as_ref(),
        )?;
        self.last_saved_step = Some(self.global_step);
        self.snapshots.push(snapshot);
        Ok(())
    }

    #[cfg(feature = "progress-bar")]
    fn progress_bar(&self) -> Option<ProgressBar> {
        if !self.group.is_main_process() {
            return None;
        }
        let pb = ProgressBar::new(self.max_train_steps as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("Steps {bar:40.cyan/blue} {pos}/{len} [{elapsed}<{eta}] {msg}")
        {
            pb.set_style(style);
        }
        Some(pb)
    }

    #[cfg(feature = "progress-bar")]
    fn finish_progress(progress: &Option<ProgressBar>) {
        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
    }

    #[cfg(feature = "progress-bar")]
    fn update_progress(&self, progress: &Option<ProgressBar>) {
        if let Some(pb) = progress {
            pb.set_position(self.global_step as u64);
        }
    }
}
