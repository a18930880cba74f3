mod common;

use candle_core::{Device, Tensor};
use eri_finetune::models::tiny::{TinyTextEncoder, TinyUNet, TinyVae};
use eri_finetune::models::{DenoisingModel, HashTokenizer, LayerGraph, PromptTokenizer, TextEncoderModel};
use eri_finetune::trainers::data::build_examples;
use eri_finetune::trainers::{
    build_coordinator, train, BatchSource, CheckpointManager, Config, DDPMScheduler, InMemoryLoader, MemorySink,
    MetricsSink, Networks, SingleProcess, StepCoordinator, TrainingBatch,
};
use eri_finetune::{FinetuneError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use common::{base_config, step_dirs, write_images};

fn memory_sinks(sink: &MemorySink) -> Vec<Box<dyn MetricsSink>> {
    vec![Box::new(sink.clone())]
}

#[test]
fn test_end_to_end_single_checkpoint() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_images(&root.path().join("instance"), 10, 16);
    let mut config = base_config(root.path());
    config.train.max_train_steps = Some(5);
    config.save.save_interval = 5;
    config.save.save_n_sample = 1;

    let summary = train(&config)?;
    assert_eq!(summary.global_step, 5);
    assert_eq!(summary.micro_steps, 5);
    assert_eq!(summary.checkpoints.len(), 1);

    let out = root.path().join("out");
    assert_eq!(step_dirs(&out), vec![5]);
    let step_dir = out.join("5");
    assert!(step_dir.join("lora_unet.safetensors").exists());
    assert!(step_dir.join("pipeline.json").exists());
    assert!(step_dir.join("samples").join("5.jpg").exists());
    assert!(!step_dir.join("text_encoder").exists());
    assert!(out.join("args.yaml").exists());
    Ok(())
}

#[test]
fn test_nothing_trainable_fails_before_training() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_images(&root.path().join("instance"), 2, 16);
    let mut config = base_config(root.path());
    config.unet.module_or_class.clear();

    let sink = MemorySink::new();
    let err = build_coordinator(&config, Arc::new(SingleProcess), memory_sinks(&sink))
        .err()
        .unwrap();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("does not train anything"));
    assert!(sink.records().is_empty());
    assert!(!root.path().join("out").join("1").exists());
    Ok(())
}

#[test]
fn test_global_step_per_accumulation_group() -> Result<()> {
    for (accumulation, expected) in [(1, 8), (2, 4), (4, 2)] {
        let root = tempfile::tempdir()?;
        write_images(&root.path().join("instance"), 8, 16);
        let mut config = base_config(root.path());
        config.train.gradient_accumulation_steps = accumulation;

        let sink = MemorySink::new();
        let mut coordinator = build_coordinator(&config, Arc::new(SingleProcess), memory_sinks(&sink))?;
        assert_eq!(coordinator.max_train_steps(), expected);
        let summary = coordinator.run()?;

        assert_eq!(summary.global_step, expected, "accumulation {}", accumulation);
        assert_eq!(summary.micro_steps, 8);
        let steps: Vec<usize> = sink.records().iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, (1..=expected).collect::<Vec<_>>());
        for (_, metrics) in sink.records() {
            assert!(metrics["Loss/pred"].is_finite());
            assert_eq!(metrics["lr"], 0.001);
            assert!(!metrics.contains_key("Loss/prior"));
        }
        // only the final save
        assert_eq!(step_dirs(&root.path().join("out")), vec![expected]);
    }
    Ok(())
}

#[test]
fn test_trailing_partial_group_is_one_step() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_images(&root.path().join("instance"), 6, 16);
    let mut config = base_config(root.path());
    config.train.gradient_accumulation_steps = 4;
    config.train.num_train_epochs = 2;

    let sink = MemorySink::new();
    let mut coordinator = build_coordinator(&config, Arc::new(SingleProcess), memory_sinks(&sink))?;
    assert_eq!(coordinator.num_update_steps_per_epoch(), 2);
    let summary = coordinator.run()?;
    assert_eq!(summary.global_step, 4);
    assert_eq!(summary.micro_steps, 12);
    assert_eq!(summary.epochs, 2);
    Ok(())
}

#[test]
fn test_prior_ema_and_embedding_guard() -> Result<()> {
    let root = tempfile::tempdir()?;
    write_images(&root.path().join("instance"), 3, 16);
    write_images(&root.path().join("class"), 4, 16);
    let mut config = base_config(root.path());
    config.prior.with_prior_preservation = true;
    config.prior.class_data_dir = Some(root.path().join("class"));
    config.prior.class_prompt = "a photo of dog".to_string();
    config.prior.prior_loss_weight = 2.5;
    config.text_encoder.module_or_class = vec!["CLIPTextEmbeddings".to_string()];
    config.text_encoder.submodule = vec!["token_embedding".to_string()];
    config.train.learning_rate_text = Some(0.01);
    config.train.freeze_non_instance_embeddings = true;
    config.model.add_instance_token = true;
    config.ema.use_ema = true;
    config.train.max_train_steps = Some(3);

    let sink = MemorySink::new();
    let mut coordinator = build_coordinator(&config, Arc::new(SingleProcess), memory_sinks(&sink))?;
    let summary = coordinator.run()?;
    assert_eq!(summary.global_step, 3);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    for (_, m) in &records {
        let expected = m["Loss/pred"] + 2.5 * m["Loss/prior"];
        assert!((m["Loss/total"] - expected).abs() < 1e-4 * expected.abs().max(1.0));
        assert_eq!(m["lr/unet"], 0.001);
        assert_eq!(m["lr/text"], 0.01);
        assert!(m.contains_key("ema_decay"));
    }
    assert!(records[2].1["ema_decay"] >= records[1].1["ema_decay"]);

    // rebuild the initial text encoder from the same seed
    let mut rng = StdRng::seed_from_u64(config.train.seed);
    let device = Device::Cpu;
    let _ = TinyUNet::new(config.model.unet_arch, &mut rng, &device)?;
    let initial = TinyTextEncoder::new(config.model.text_encoder_arch, &mut rng, &device)?;

    let mut tokenizer = HashTokenizer::new(
        config.model.text_encoder_arch.vocab_size,
        config.model.text_encoder_arch.max_length,
    )?;
    let instance_id = tokenizer.add_token(&config.model.instance_token)? as usize;

    let embedding = |graph: &LayerGraph| -> Vec<Vec<f32>> {
        graph
            .get("embeddings.token_embedding")
            .unwrap()
            .layer
            .base()
            .weight
            .tensor()
            .to_vec2::<f32>()
            .unwrap()
    };
    let before = embedding(initial.layers());
    let after = embedding(coordinator.text_encoder().layers());
    for (row, (b, a)) in before.iter().zip(after.iter()).enumerate() {
        if row == instance_id {
            assert_ne!(b, a, "instance token embedding should train");
        } else {
            assert_eq!(b, a, "row {} changed", row);
        }
    }
    assert!(tokenizer.encode("a photo of sks dog").contains(&(instance_id as u32)));
    Ok(())
}

/// Delegates to a real denoiser but poisons its prediction.
struct DivergingUNet(TinyUNet);

impl DenoisingModel for DivergingUNet {
    fn layers(&self) -> &LayerGraph {
        self.0.layers()
    }

    fn layers_mut(&mut self) -> &mut LayerGraph {
        self.0.layers_mut()
    }

    fn forward(&self, noisy_latents: &Tensor, timesteps: &Tensor, context: &Tensor) -> Result<Tensor> {
        Ok((self.0.forward(noisy_latents, timesteps, context)? * f64::NAN)?)
    }
}

fn tiny_networks(config: &Config, unet: Box<dyn DenoisingModel + Send>, rng: &mut StdRng) -> Result<Networks> {
    let device = Device::Cpu;
    Ok(Networks {
        unet,
        text_encoder: Box::new(TinyTextEncoder::new(config.model.text_encoder_arch, rng, &device)?),
        vae: Box::new(TinyVae::new(4, 4, rng, &device)?),
        noise_scheduler: DDPMScheduler::new(&config.model.noise_scheduler, &device)?,
        instance_token_id: None,
    })
}

/// A source whose shard came out empty.
struct NoBatches;

impl BatchSource for NoBatches {
    fn num_examples(&self) -> usize {
        0
    }

    fn num_batches(&self) -> usize {
        0
    }

    fn epoch_batches(&self, _epoch: usize) -> Result<Vec<TrainingBatch>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_empty_data_source_is_configuration_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = base_config(root.path());
    let mut rng = StdRng::seed_from_u64(0);
    let unet = Box::new(TinyUNet::new(config.model.unet_arch, &mut rng, &Device::Cpu)?);
    let networks = tiny_networks(&config, unet, &mut rng)?;

    let err = StepCoordinator::setup(
        &config,
        networks,
        Box::new(NoBatches),
        Arc::new(SingleProcess),
        CheckpointManager::new(config.checkpoint_config(), None),
        Vec::new(),
    )
    .err()
    .unwrap();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("no batches"));
    Ok(())
}

#[test]
fn test_non_finite_loss_aborts_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = base_config(root.path());
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(0);

    let tokenizer = HashTokenizer::new(64, 8)?;
    let images: Vec<Tensor> = (0..2)
        .map(|_| Tensor::zeros((3, 16, 16), candle_core::DType::F32, &device))
        .collect::<std::result::Result<_, _>>()?;
    let examples = build_examples(&tokenizer, &images, "a photo of sks dog", None)?;
    let loader = InMemoryLoader::new(examples, tokenizer.encode_padded(""), 1, 0, device.clone())?;

    let unet = Box::new(DivergingUNet(TinyUNet::new(config.model.unet_arch, &mut rng, &device)?));
    let networks = tiny_networks(&config, unet, &mut rng)?;
    let sink = MemorySink::new();
    let mut coordinator = StepCoordinator::setup(
        &config,
        networks,
        Box::new(loader),
        Arc::new(SingleProcess),
        CheckpointManager::new(config.checkpoint_config(), None),
        memory_sinks(&sink),
    )?;

    match coordinator.run() {
        Err(FinetuneError::NumericDivergence { step, value }) => {
            assert_eq!(step, 0);
            assert!(value.is_nan());
        }
        other => panic!("expected divergence, got {:?}", other.map(|s| s.global_step)),
    }
    assert!(sink.records().is_empty());
    assert_eq!(coordinator.global_step(), 0);
    Ok(())
}
