#![allow(dead_code)]

use eri_finetune::Config;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::Path;

/// Writes `n` distinct `size x size` PNGs into `dir`.
pub fn write_images(dir: &Path, n: usize, size: u32) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..n as u32 {
        let img = RgbImage::from_fn(size, size, |x, y| {
            Rgb([
                ((x * 16 + i * 20) % 256) as u8,
                ((y * 16 + i * 7) % 256) as u8,
                ((i * 25) % 256) as u8,
            ])
        });
        img.save(dir.join(format!("{:02}.png", i))).unwrap();
    }
}

/// Small adapter-training run over `<root>/instance`, writing to `<root>/out`.
pub fn base_config(root: &Path) -> Config {
    let yaml = format!(
        r#"
model:
  pretrained_model_name_or_path: tiny
  resolution: 16
  vae_downsample: 4
unet:
  module_or_class: [CrossAttention]
  lora_layer: [Linear]
  lora_rank: 2
train:
  instance_data_dir: '{instance}'
  instance_prompt: a photo of sks dog
  learning_rate: 0.001
  lr_scheduler: constant
save:
  output_dir: '{out}'
  save_interval: 1000
  save_n_sample: 0
  save_infer_steps: 2
logging:
  metrics_jsonl: false
"#,
        instance = root.join("instance").display(),
        out = root.join("out").display(),
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// Names of the step directories under `dir`, sorted numerically.
pub fn step_dirs(dir: &Path) -> Vec<usize> {
    let mut steps: Vec<usize> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
        .collect();
    steps.sort();
    steps
}
