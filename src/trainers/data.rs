//! Training examples, batch collation and rank-sharded loading
//!
//! Batches put every instance example first and every prior (class) example
//! second, and record both counts in a [`BatchLayout`].

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FinetuneError, Result};
use crate::models::PromptTokenizer;

/// How many leading rows of a batch are instance examples and how many
/// trailing rows are prior examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchLayout {
    pub instance_count: usize,
    pub prior_count: usize,
}

impl BatchLayout {
    pub fn instance_only(n: usize) -> Self {
        Self {
            instance_count: n,
            prior_count: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.instance_count + self.prior_count
    }

    pub fn has_prior(&self) -> bool {
        self.prior_count > 0
    }
}

#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// `[B, L]` U32 token ids padded to the tokenizer length.
    pub input_ids: Tensor,
    /// `[B, 3, H, W]` F32 in `[-1, 1]`.
    pub pixel_values: Tensor,
    pub layout: BatchLayout,
    /// Padded ids of the unconditional prompt, used by conditioning dropout.
    pub unconditional_ids: Vec<u32>,
}

/// Instance image and prompt, optionally paired with a class image and prompt.
#[derive(Debug, Clone)]
pub struct Example {
    pub pixel_values: Tensor,
    pub input_ids: Vec<u32>,
    pub prior: Option<(Tensor, Vec<u32>)>,
}

/// Pairs instance and class images the way the fine-tuning dataset does:
/// its length is the larger of the two sets and both wrap around.
pub fn build_examples(
    tokenizer: &dyn PromptTokenizer,
    instance_images: &[Tensor],
    instance_prompt: &str,
    class_images: Option<(&[Tensor], &str)>,
) -> Result<Vec<Example>> {
    if instance_images.is_empty() {
        return Err(FinetuneError::config("no instance images"));
    }
    let instance_ids = tokenizer.encode_padded(instance_prompt);
    let len = match class_images {
        Some((images, _)) if images.is_empty() => {
            return Err(FinetuneError::config("prior preservation needs class images"))
        }
        Some((images, _)) => instance_images.len().max(images.len()),
        None => instance_images.len(),
    };
    let class_ids = class_images.map(|(_, prompt)| tokenizer.encode_padded(prompt));

    Ok((0..len)
        .map(|i| Example {
            pixel_values: instance_images[i % instance_images.len()].clone(),
            input_ids: instance_ids.clone(),
            prior: match (class_images, &class_ids) {
                (Some((images, _)), Some(ids)) => Some((images[i % images.len()].clone(), ids.clone())),
                _ => None,
            },
        })
        .collect())
}

/// Stacks examples into one batch, instance rows first.
pub fn collate(examples: &[&Example], unconditional_ids: &[u32], device: &Device) -> Result<TrainingBatch> {
    let mut ids: Vec<&[u32]> = examples.iter().map(|e| e.input_ids.as_slice()).collect();
    let mut pixels: Vec<&Tensor> = examples.iter().map(|e| &e.pixel_values).collect();
    let mut prior_count = 0;
    for example in examples {
        if let Some((px, pid)) = &example.prior {
            ids.push(pid);
            pixels.push(px);
            prior_count += 1;
        }
    }
    if prior_count != 0 && prior_count != examples.len() {
        return Err(FinetuneError::Model(
            "either every example or none carries a prior pair".to_string(),
        ));
    }

    let seq_len = ids.first().map(|r| r.len()).unwrap_or(0);
    if ids.iter().any(|r| r.len() != seq_len) || unconditional_ids.len() != seq_len {
        return Err(FinetuneError::Model("token rows differ in length".to_string()));
    }
    let flat: Vec<u32> = ids.iter().flat_map(|r| r.iter().copied()).collect();
    let input_ids = Tensor::from_vec(flat, (ids.len(), seq_len), device)?;
    let pixel_values = Tensor::stack(&pixels, 0)?
        .to_dtype(DType::F32)?
        .to_device(device)?;

    Ok(TrainingBatch {
        input_ids,
        pixel_values,
        layout: BatchLayout {
            instance_count: examples.len(),
            prior_count,
        },
        unconditional_ids: unconditional_ids.to_vec(),
    })
}

/// Yields the batches of one epoch on this process.
pub trait BatchSource {
    fn num_examples(&self) -> usize;

    /// Batches per epoch on this rank.
    fn num_batches(&self) -> usize;

    fn epoch_batches(&self, epoch: usize) -> Result<Vec<TrainingBatch>>;
}

/// Shuffling loader over examples held in memory, sharded by rank.
///
/// Every epoch draws one global permutation from `seed + epoch`; rank `r`
/// takes positions `r, r + world, ...`, with the permutation padded by
/// wrap-around so all ranks see the same number of batches.
pub struct InMemoryLoader {
    examples: Vec<Example>,
    unconditional_ids: Vec<u32>,
    batch_size: usize,
    seed: u64,
    rank: usize,
    world_size: usize,
    device: Device,
}

impl InMemoryLoader {
    pub fn new(
        examples: Vec<Example>,
        unconditional_ids: Vec<u32>,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if examples.is_empty() {
            return Err(FinetuneError::config("the training set is empty"));
        }
        if batch_size == 0 {
            return Err(FinetuneError::config("train_batch_size must be positive"));
        }
        Ok(Self {
            examples,
            unconditional_ids,
            batch_size,
            seed,
            rank: 0,
            world_size: 1,
            device,
        })
    }

    pub fn sharded(mut self, rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(FinetuneError::Distributed(format!(
                "rank {} outside a world of {}",
                rank, world_size
            )));
        }
        self.rank = rank;
        self.world_size = world_size;
        Ok(self)
    }

    fn per_rank(&self) -> usize {
        (self.examples.len() + self.world_size - 1) / self.world_size
    }

    /// Example indices this rank visits in `epoch`, in order.
    pub fn shard_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let total = self.per_rank() * self.world_size;
        let mut padded = order.clone();
        padded.extend(order.iter().cycle().take(total - order.len()));
        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

impl BatchSource for InMemoryLoader {
    fn num_examples(&self) -> usize {
        self.examples.len()
    }

    fn num_batches(&self) -> usize {
        (self.per_rank() + self.batch_size - 1) / self.batch_size
    }

    fn epoch_batches(&self, epoch: usize) -> Result<Vec<TrainingBatch>> {
        self.shard_order(epoch)
            .chunks(self.batch_size)
            .map(|chunk| {
                let examples: Vec<&Example> = chunk.iter().map(|&i| &self.examples[i]).collect();
                collate(&examples, &self.unconditional_ids, &self.device)
            })
            .collect()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            matches!(
                ext.to_string_lossy().to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp"
            )
        })
        .unwrap_or(false)
}

/// Loads every image in `dir` (sorted by file name), resized and centre
/// cropped to `resolution` squared, as `[3, H, W]` F32 in `[-1, 1]`.
pub fn load_image_folder(dir: &Path, resolution: u32, device: &Device) -> Result<Vec<Tensor>> {
    if !dir.is_dir() {
        return Err(FinetuneError::config(format!(
            "image directory {} does not exist",
            dir.display()
        )));
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in &paths {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!("Skipping unreadable image {}: {}", path.display(), e);
                continue;
            }
        };
        let img = img
            .resize_to_fill(resolution, resolution, FilterType::Lanczos3)
            .to_rgb8();
        let (w, h) = img.dimensions();
        let data: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32 / 127.5 - 1.0).collect();
        let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?.permute((2, 0, 1))?;
        images.push(tensor.contiguous()?);
    }
    info!("Loaded {} images from {}", images.len(), dir.display());
    if images.is_empty() {
        return Err(FinetuneError::config(format!(
            "no images found in {}",
            dir.display()
        )));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HashTokenizer;

    fn pixels(value: f32) -> Tensor {
        Tensor::full(value, (3, 4, 4), &Device::Cpu).unwrap()
    }

    fn tokenizer() -> HashTokenizer {
        HashTokenizer::new(64, 6).unwrap()
    }

    #[test]
    fn test_instance_rows_come_first() -> Result<()> {
        let tok = tokenizer();
        let instance = vec![pixels(0.5), pixels(0.25)];
        let class = vec![pixels(-0.5)];
        let examples = build_examples(&tok, &instance, "a sks dog", Some((class.as_slice(), "a dog")))?;
        assert_eq!(examples.len(), 2);

        let refs: Vec<&Example> = examples.iter().collect();
        let batch = collate(&refs, &tok.encode_padded(" "), &Device::Cpu)?;
        assert_eq!(
            batch.layout,
            BatchLayout {
                instance_count: 2,
                prior_count: 2
            }
        );
        assert_eq!(batch.pixel_values.dims(), &[4, 3, 4, 4]);
        let firsts: Vec<f32> = (0..4)
            .map(|i| {
                batch
                    .pixel_values
                    .get(i)
                    .and_then(|t| t.flatten_all())
                    .and_then(|t| t.get(0))
                    .and_then(|t| t.to_scalar::<f32>())
                    .unwrap()
            })
            .collect();
        assert_eq!(firsts, vec![0.5, 0.25, -0.5, -0.5]);

        let ids = batch.input_ids.to_vec2::<u32>()?;
        assert_eq!(ids[0], tok.encode_padded("a sks dog"));
        assert_eq!(ids[3], tok.encode_padded("a dog"));
        Ok(())
    }

    #[test]
    fn test_shards_are_disjoint_and_balanced() -> Result<()> {
        let tok = tokenizer();
        let images: Vec<Tensor> = (0..10).map(|i| pixels(i as f32)).collect();
        let examples = build_examples(&tok, &images, "x", None)?;
        let uncond = tok.encode_padded(" ");

        let make = |rank| {
            InMemoryLoader::new(examples.clone(), uncond.clone(), 2, 7, Device::Cpu)
                .and_then(|l| l.sharded(rank, 3))
        };
        let shards: Vec<Vec<usize>> = (0..3).map(|r| make(r).map(|l| l.shard_order(1))).collect::<Result<_>>()?;
        assert!(shards.iter().all(|s| s.len() == 4));
        let mut seen: Vec<usize> = shards.concat();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);

        let loader = make(0)?;
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.epoch_batches(0)?.len(), 2);
        assert_ne!(loader.shard_order(0), loader.shard_order(1));
        Ok(())
    }

    #[test]
    fn test_load_image_folder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let img = image::RgbImage::from_pixel(8, 6, image::Rgb([255, 0, 128]));
        img.save(dir.path().join("a.png"))?;
        fs::write(dir.path().join("notes.txt"), "not an image")?;

        let images = load_image_folder(dir.path(), 4, &Device::Cpu)?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dims(), &[3, 4, 4]);
        let red = images[0].get(0)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(red.iter().all(|&v| (v - 1.0).abs() < 1e-4));

        let empty = tempfile::tempdir()?;
        assert!(load_image_folder(empty.path(), 4, &Device::Cpu)
            .unwrap_err()
            .is_configuration());
        Ok(())
    }
}
