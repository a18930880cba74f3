//! Step-keyed checkpoint directories
//!
//! A checkpoint is written in two independent phases. Weights come first and
//! any failure there is fatal. Sample rendering follows; its failures are
//! logged and the snapshot is still returned.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FinetuneError, Result};
use crate::models::weights::write_safetensors;
use crate::models::{lora, DenoisingModel, LayerGraph, TextEncoderModel};
use crate::trainers::ema::EMATracker;
use crate::trainers::sampling_utils::{image_grid, save_jpeg, SampleRenderer, SampleRequest};
use crate::trainers::selection::TrainableParameterSet;

pub const SAMPLE_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub output_dir: PathBuf,
    /// Where the frozen base weights live; recorded in `pipeline.json`.
    pub pretrained_model: String,
    /// Contact sheet rows; zero disables sampling.
    pub save_n_sample: usize,
    pub sample_prompts: Vec<String>,
    pub negative_prompt: String,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub sample_seed: u64,
}

/// What one checkpoint wrote. Never modified after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub step: usize,
    pub dir: PathBuf,
    pub weight_files: Vec<PathBuf>,
    pub sample_sheet: Option<PathBuf>,
}

pub struct CheckpointManager {
    config: CheckpointConfig,
    renderer: Option<Box<dyn SampleRenderer + Send>>,
}

/// Weights of one model as they are deployed.
fn deploy_graph(live: &LayerGraph, ema: Option<&EMATracker>) -> LayerGraph {
    let mut graph = match ema {
        Some(ema) => ema.averaged_graph(live),
        None => live.with_weights(&HashMap::new()),
    };
    lora::set_scale(&mut graph, 1.0);
    graph
}

/// Adapter deltas when adapters are in use (plus the adapted layers' own
/// weights if those trained), every parameter for a fully trained model,
/// nothing for a frozen one.
fn save_model_weights(
    dir: &Path,
    graph: &LayerGraph,
    set: &TrainableParameterSet,
    step: usize,
) -> Result<Option<PathBuf>> {
    if let Some(adapters) = set.adapters() {
        let path = dir.join(format!("lora_{}.safetensors", set.model()));
        lora::save_adapters(graph, &path, adapters.includes_base)?;
        return Ok(Some(path));
    }
    if !set.has_any_trainable() {
        return Ok(None);
    }
    let model_dir = dir.join(set.model());
    fs::create_dir_all(&model_dir).map_err(|e| FinetuneError::persistence(&model_dir, e))?;
    let path = model_dir.join("model.safetensors");
    let mut metadata = HashMap::new();
    metadata.insert("step".to_string(), step.to_string());
    metadata.insert("model".to_string(), set.model().to_string());
    write_safetensors(&path, &graph.named_tensors(), metadata)?;
    info!("Saved full {} weights to {}", set.model(), path.display());
    Ok(Some(path))
}

fn describe(dir: &Path, set: &TrainableParameterSet, file: Option<&PathBuf>) -> serde_json::Value {
    let relative = file.map(|f| f.strip_prefix(dir).unwrap_or(f).display().to_string());
    match (set.adapters(), relative) {
        (Some(adapters), Some(file)) => json!({
            "weights": "base",
            "adapters": file,
            "adapter_rank": adapters.rank,
            "adapted_layers": adapters.paths,
            "adapter_scale": 1.0,
            "adapter_includes_base": adapters.includes_base,
        }),
        (None, Some(file)) => json!({ "weights": file }),
        _ => json!({ "weights": "base" }),
    }
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, renderer: Option<Box<dyn SampleRenderer + Send>>) -> Self {
        Self { config, renderer }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.config.output_dir.join(step.to_string())
    }

    /// Writes `<output_dir>/<step>/`. The models are left exactly as they
    /// were; sampling temporarily swaps the deployable weights in.
    pub fn save(
        &self,
        step: usize,
        unet: &mut dyn DenoisingModel,
        text_encoder: &mut dyn TextEncoderModel,
        unet_set: &TrainableParameterSet,
        text_set: &TrainableParameterSet,
        ema: Option<&EMATracker>,
    ) -> Result<CheckpointSnapshot> {
        let dir = self.checkpoint_dir(step);
        if dir.join("pipeline.json").exists() {
            return Err(FinetuneError::persistence(&dir, "checkpoint already exists"));
        }
        fs::create_dir_all(&dir).map_err(|e| FinetuneError::persistence(&dir, e))?;

        let unet_graph = deploy_graph(unet.layers(), ema);
        let text_graph = deploy_graph(text_encoder.layers(), None);

        let unet_file = save_model_weights(&dir, &unet_graph, unet_set, step)?;
        let text_file = save_model_weights(&dir, &text_graph, text_set, step)?;

        let mut pipeline = json!({
            "step": step,
            "pretrained_model": self.config.pretrained_model,
            "ema": ema.is_some(),
        });
        pipeline[unet.name()] = describe(&dir, unet_set, unet_file.as_ref());
        pipeline[text_encoder.name()] = describe(&dir, text_set, text_file.as_ref());
        let pipeline_path = dir.join("pipeline.json");
        fs::write(&pipeline_path, serde_json::to_string_pretty(&pipeline)?)
            .map_err(|e| FinetuneError::persistence(&pipeline_path, e))?;

        let weight_files: Vec<PathBuf> = unet_file.into_iter().chain(text_file).collect();

        let sample_sheet = match &self.renderer {
            Some(renderer) if self.config.save_n_sample > 0 && !self.config.sample_prompts.is_empty() => {
                let live_unet = std::mem::replace(unet.layers_mut(), unet_graph);
                let live_text = std::mem::replace(text_encoder.layers_mut(), text_graph);
                let rendered = self.render_sheet(step, renderer.as_ref(), &*unet, &*text_encoder, &dir);
                *unet.layers_mut() = live_unet;
                *text_encoder.layers_mut() = live_text;
                match rendered {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!("Sample generation for step {} failed: {}", step, e);
                        None
                    }
                }
            }
            _ => None,
        };

        info!("[*] Weights saved at {}", dir.display());
        Ok(CheckpointSnapshot {
            step,
            dir,
            weight_files,
            sample_sheet,
        })
    }

    fn render_sheet(
        &self,
        step: usize,
        renderer: &dyn SampleRenderer,
        unet: &dyn DenoisingModel,
        text_encoder: &dyn TextEncoderModel,
        dir: &Path,
    ) -> Result<PathBuf> {
        let request = SampleRequest {
            prompts: self.config.sample_prompts.clone(),
            negative_prompt: self.config.negative_prompt.clone(),
            guidance_scale: self.config.guidance_scale,
            num_inference_steps: self.config.num_inference_steps,
        };
        let mut rng = StdRng::seed_from_u64(self.config.sample_seed);
        let mut images = Vec::with_capacity(self.config.save_n_sample * request.prompts.len());
        for _ in 0..self.config.save_n_sample {
            images.extend(renderer.render(unet, text_encoder, &request, &mut rng)?);
        }
        let grid = image_grid(&images, self.config.save_n_sample, request.prompts.len())?;
        let path = dir.join("samples").join(format!("{}.jpg", step));
        save_jpeg(&grid, &path, SAMPLE_JPEG_QUALITY)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lora::load_adapters;
    use crate::models::tiny::{TinyTextEncoder, TinyTextEncoderConfig, TinyUNet, TinyUNetConfig};
    use crate::trainers::selection::{select_trainable, SelectionSpec};
    use candle_core::{Device, Tensor};
    use image::RgbImage;

    struct FlatRenderer;

    impl SampleRenderer for FlatRenderer {
        fn render(
            &self,
            _unet: &dyn DenoisingModel,
            _text_encoder: &dyn TextEncoderModel,
            request: &SampleRequest,
            _rng: &mut StdRng,
        ) -> Result<Vec<RgbImage>> {
            Ok(request.prompts.iter().map(|_| RgbImage::new(8, 8)).collect())
        }
    }

    struct FailingRenderer;

    impl SampleRenderer for FailingRenderer {
        fn render(
            &self,
            _unet: &dyn DenoisingModel,
            _text_encoder: &dyn TextEncoderModel,
            _request: &SampleRequest,
            _rng: &mut StdRng,
        ) -> Result<Vec<RgbImage>> {
            Err(FinetuneError::Model("renderer exploded".to_string()))
        }
    }

    fn config(output_dir: &Path) -> CheckpointConfig {
        CheckpointConfig {
            output_dir: output_dir.to_path_buf(),
            pretrained_model: "tiny".to_string(),
            save_n_sample: 2,
            sample_prompts: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            negative_prompt: String::new(),
            guidance_scale: 7.5,
            num_inference_steps: 2,
            sample_seed: 0,
        }
    }

    fn models() -> Result<(TinyUNet, TinyTextEncoder, TrainableParameterSet, TrainableParameterSet)> {
        let mut rng = StdRng::seed_from_u64(3);
        let device = Device::Cpu;
        let mut unet = TinyUNet::new(TinyUNetConfig::default(), &mut rng, &device)?;
        let mut text = TinyTextEncoder::new(TinyTextEncoderConfig::default(), &mut rng, &device)?;

        let spec = SelectionSpec {
            module_or_class: vec!["CrossAttention".into()],
            lora_layer: vec!["Linear".into()],
            lora_rank: 2,
            lora_scale: 0.5,
            ..Default::default()
        };
        let (graph, unet_set) = select_trainable("unet", std::mem::take(unet.layers_mut()), &spec, 1e-4, &mut rng)?;
        *unet.layers_mut() = graph;

        let text_spec = SelectionSpec {
            module_or_class: vec!["CLIPMLP".into()],
            ..Default::default()
        };
        let (graph, text_set) =
            select_trainable("text_encoder", std::mem::take(text.layers_mut()), &text_spec, 1e-4, &mut rng)?;
        *text.layers_mut() = graph;
        Ok((unet, text, unet_set, text_set))
    }

    #[test]
    fn test_adapter_and_full_weights_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut unet, mut text, unet_set, text_set) = models()?;
        let manager = CheckpointManager::new(config(dir.path()), Some(Box::new(FlatRenderer)));

        let snapshot = manager.save(7, &mut unet, &mut text, &unet_set, &text_set, None)?;
        assert_eq!(snapshot.dir, dir.path().join("7"));
        assert_eq!(
            snapshot.weight_files,
            vec![
                dir.path().join("7").join("lora_unet.safetensors"),
                dir.path().join("7").join("text_encoder").join("model.safetensors"),
            ]
        );
        let sheet = snapshot.sample_sheet.clone().unwrap();
        assert_eq!(sheet, dir.path().join("7").join("samples").join("7.jpg"));
        // 2 rows x 3 prompts of 8x8 tiles
        assert_eq!(image::open(&sheet)?.to_rgb8().dimensions(), (24, 16));

        let pipeline: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("7").join("pipeline.json"))?)?;
        assert_eq!(pipeline["unet"]["adapters"], json!("lora_unet.safetensors"));
        assert_eq!(pipeline["unet"]["adapter_scale"], json!(1.0));

        // the deployable adapters carry scale 1.0, the live model keeps its own
        let fresh = TinyUNet::new(TinyUNetConfig::default(), &mut StdRng::seed_from_u64(3), &Device::Cpu)?;
        let (loaded, adapters) = load_adapters(
            fresh.layers().clone(),
            &snapshot.weight_files[0],
            &Device::Cpu,
        )?;
        assert_eq!(adapters.len(), 4);
        assert!(lora::extract(&loaded).iter().all(|a| a.scale == 1.0));
        assert!(lora::extract(unet.layers()).iter().all(|a| a.scale == 0.5));
        assert_eq!(unet.layers().trainable_vars().len(), 8);

        // same step twice would mutate a snapshot
        assert!(manager.save(7, &mut unet, &mut text, &unet_set, &text_set, None).is_err());
        Ok(())
    }

    #[test]
    fn test_sample_failure_keeps_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut unet, mut text, unet_set, text_set) = models()?;
        let manager = CheckpointManager::new(config(dir.path()), Some(Box::new(FailingRenderer)));

        let snapshot = manager.save(3, &mut unet, &mut text, &unet_set, &text_set, None)?;
        assert!(snapshot.sample_sheet.is_none());
        assert!(snapshot.weight_files.iter().all(|f| f.exists()));
        // live graphs were restored after the failed render
        assert_eq!(unet.layers().trainable_vars().len(), 8);
        assert!(!text.layers().trainable_vars().is_empty());
        Ok(())
    }

    #[test]
    fn test_off_target_weights_are_persisted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let mut unet = TinyUNet::new(TinyUNetConfig::default(), &mut rng, &device)?;
        let mut text = TinyTextEncoder::new(TinyTextEncoderConfig::default(), &mut rng, &device)?;
        let spec = SelectionSpec {
            module_or_class: vec!["CrossAttention".into()],
            lora_layer: vec!["Linear".into()],
            lora_rank: 2,
            lora_train_off_target: true,
            ..Default::default()
        };
        let (graph, unet_set) = select_trainable("unet", std::mem::take(unet.layers_mut()), &spec, 1e-4, &mut rng)?;
        *unet.layers_mut() = graph;
        let (graph, text_set) = select_trainable(
            "text_encoder",
            std::mem::take(text.layers_mut()),
            &SelectionSpec::default(),
            1e-4,
            &mut rng,
        )?;
        *text.layers_mut() = graph;

        let mut off_target = Vec::new();
        for (name, var) in unet_set.vars() {
            if !name.contains("lora_") {
                var.set(&(var.as_tensor() + 1.0)?)?;
                off_target.push(name.clone());
            }
        }
        assert!(!off_target.is_empty());

        let manager = CheckpointManager::new(config(dir.path()), None);
        let snapshot = manager.save(1, &mut unet, &mut text, &unet_set, &text_set, None)?;
        assert_eq!(snapshot.weight_files, vec![dir.path().join("1").join("lora_unet.safetensors")]);

        let pipeline: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("1").join("pipeline.json"))?)?;
        assert_eq!(pipeline["unet"]["adapter_includes_base"], json!(true));

        let fresh = TinyUNet::new(TinyUNetConfig::default(), &mut StdRng::seed_from_u64(3), &device)?;
        let (loaded, adapters) = load_adapters(fresh.layers().clone(), &snapshot.weight_files[0], &device)?;
        assert!(adapters.includes_base);
        let restored: HashMap<String, Tensor> = loaded.named_tensors().into_iter().collect();
        for name in &off_target {
            let live = unet_set
                .vars()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_tensor().flatten_all())
                .unwrap()?
                .to_vec1::<f32>()?;
            assert_eq!(restored[name].flatten_all()?.to_vec1::<f32>()?, live, "{} not restored", name);
        }
        Ok(())
    }
}
