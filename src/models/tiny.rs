//! Small reference networks with the same layer naming as the full models
//!
//! These are deterministic, randomly initialised stand-ins for a pretrained
//! UNet, CLIP text encoder and VAE encoder. They are small enough to train on
//! CPU, which is what the smoke run and the integration tests rely on.

use candle_core::{DType, Device, Tensor, D};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FinetuneError, Result};
use crate::models::layers::{BaseLayer, LayerGraph, LayerOp};
use crate::models::{DenoisingModel, ImageEncoder, PromptTokenizer, TextEncoderModel};

fn randn(rng: &mut impl Rng, shape: &[usize], std: f32, device: &Device) -> Result<Tensor> {
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| FinetuneError::Model(format!("invalid init std {}: {}", std, e)))?;
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| normal.sample(rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn init_layer(rng: &mut impl Rng, op: LayerOp, bias: bool, device: &Device) -> Result<BaseLayer> {
    let (shape, fan_in) = match op {
        LayerOp::Linear {
            in_features,
            out_features,
        } => (vec![out_features, in_features], in_features),
        LayerOp::Conv2d {
            in_channels,
            out_channels,
            kernel,
            ..
        } => (
            vec![out_channels, in_channels, kernel, kernel],
            in_channels * kernel * kernel,
        ),
        LayerOp::Embedding {
            num_embeddings,
            dim,
        } => (vec![num_embeddings, dim], 1),
    };
    let weight = randn(rng, &shape, 1.0 / (fan_in as f32).sqrt(), device)?;
    let bias = if bias {
        Some(Tensor::zeros(op.out_features(), DType::F32, device)?)
    } else {
        None
    };
    BaseLayer::new(op, weight, bias)
}

fn lin(in_features: usize, out_features: usize) -> LayerOp {
    LayerOp::Linear {
        in_features,
        out_features,
    }
}

/// Scaled dot-product attention over the last two dims.
fn attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
    let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
    Ok(probs.matmul(&v.contiguous()?)?)
}

/// Sinusoidal embedding of integer timesteps, `[B] -> [B, dim]`.
fn timestep_embedding(timesteps: &Tensor, dim: usize, dtype: DType) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000f32.ln()) * i as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), timesteps.device())?;
    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs)?;
    let emb = Tensor::cat(&[args.sin()?, args.cos()?], 1)?;
    Ok(emb.to_dtype(dtype)?)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TinyUNetConfig {
    pub latent_channels: usize,
    pub hidden_size: usize,
    pub context_dim: usize,
}

impl Default for TinyUNetConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            hidden_size: 32,
            context_dim: 16,
        }
    }
}

/// Token-mixing denoiser: latent pixels become tokens, one cross-attention
/// block reads the text conditioning, a feed-forward block follows.
pub struct TinyUNet {
    config: TinyUNetConfig,
    graph: LayerGraph,
}

impl TinyUNet {
    pub fn new(config: TinyUNetConfig, rng: &mut impl Rng, device: &Device) -> Result<Self> {
        if config.hidden_size % 2 != 0 {
            return Err(FinetuneError::config("hidden_size must be even"));
        }
        let c = config.latent_channels;
        let h = config.hidden_size;
        let ctx = config.context_dim;

        let mut graph = LayerGraph::new();
        let spec: [(&str, &str, LayerOp, bool); 9] = [
            ("proj_in", "TinyUNet", lin(c, h), true),
            ("time_embedding.linear_1", "TimestepEmbedding", lin(h, h), true),
            ("mid_block.attn2.to_q", "CrossAttention", lin(h, h), false),
            ("mid_block.attn2.to_k", "CrossAttention", lin(ctx, h), false),
            ("mid_block.attn2.to_v", "CrossAttention", lin(ctx, h), false),
            ("mid_block.attn2.to_out", "CrossAttention", lin(h, h), true),
            ("mid_block.ff.net_0", "FeedForward", lin(h, 2 * h), true),
            ("mid_block.ff.net_2", "FeedForward", lin(2 * h, h), true),
            ("proj_out", "TinyUNet", lin(h, c), true),
        ];
        for (path, class, op, bias) in spec {
            graph.push(path, class, init_layer(rng, op, bias, device)?)?;
        }
        Ok(Self { config, graph })
    }

    pub fn config(&self) -> &TinyUNetConfig {
        &self.config
    }
}

impl DenoisingModel for TinyUNet {
    fn layers(&self) -> &LayerGraph {
        &self.graph
    }

    fn layers_mut(&mut self) -> &mut LayerGraph {
        &mut self.graph
    }

    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let g = &self.graph;
        let dtype = g.compute_dtype();
        let (b, c, h, w) = noisy_latents.dims4()?;

        let x = noisy_latents
            .to_dtype(dtype)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let context = encoder_hidden_states.to_dtype(dtype)?;

        let temb = timestep_embedding(timesteps, self.config.hidden_size, dtype)?;
        let temb = g.forward("time_embedding.linear_1", &temb)?.silu()?;
        let hidden = g.forward("proj_in", &x)?.broadcast_add(&temb.unsqueeze(1)?)?;

        let q = g.forward("mid_block.attn2.to_q", &hidden)?;
        let k = g.forward("mid_block.attn2.to_k", &context)?;
        let v = g.forward("mid_block.attn2.to_v", &context)?;
        let attn = attention(&q, &k, &v)?;
        let hidden = (&hidden + g.forward("mid_block.attn2.to_out", &attn)?)?;

        let ff = g.forward("mid_block.ff.net_0", &hidden)?.gelu()?;
        let hidden = (&hidden + g.forward("mid_block.ff.net_2", &ff)?)?;

        let out = g.forward("proj_out", &hidden)?;
        Ok(out.transpose(1, 2)?.reshape((b, c, h, w))?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TinyTextEncoderConfig {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden_size: usize,
}

impl Default for TinyTextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            max_length: 8,
            hidden_size: 16,
        }
    }
}

/// One CLIP-style encoder layer over token and position embeddings.
pub struct TinyTextEncoder {
    config: TinyTextEncoderConfig,
    graph: LayerGraph,
}

const TOKEN_EMBEDDING: &str = "embeddings.token_embedding";

impl TinyTextEncoder {
    pub fn new(config: TinyTextEncoderConfig, rng: &mut impl Rng, device: &Device) -> Result<Self> {
        let d = config.hidden_size;
        let mut graph = LayerGraph::new();
        let spec: [(&str, &str, LayerOp, bool); 8] = [
            (
                TOKEN_EMBEDDING,
                "CLIPTextEmbeddings",
                LayerOp::Embedding {
                    num_embeddings: config.vocab_size,
                    dim: d,
                },
                false,
            ),
            (
                "embeddings.position_embedding",
                "CLIPTextEmbeddings",
                LayerOp::Embedding {
                    num_embeddings: config.max_length,
                    dim: d,
                },
                false,
            ),
            ("encoder.layers.0.self_attn.q_proj", "CLIPAttention", lin(d, d), true),
            ("encoder.layers.0.self_attn.k_proj", "CLIPAttention", lin(d, d), true),
            ("encoder.layers.0.self_attn.v_proj", "CLIPAttention", lin(d, d), true),
            ("encoder.layers.0.self_attn.out_proj", "CLIPAttention", lin(d, d), true),
            ("encoder.layers.0.mlp.fc1", "CLIPMLP", lin(d, 2 * d), true),
            ("encoder.layers.0.mlp.fc2", "CLIPMLP", lin(2 * d, d), true),
        ];
        for (path, class, op, bias) in spec {
            graph.push(path, class, init_layer(rng, op, bias, device)?)?;
        }
        Ok(Self { config, graph })
    }

    pub fn config(&self) -> &TinyTextEncoderConfig {
        &self.config
    }
}

impl TextEncoderModel for TinyTextEncoder {
    fn layers(&self) -> &LayerGraph {
        &self.graph
    }

    fn layers_mut(&mut self) -> &mut LayerGraph {
        &mut self.graph
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let g = &self.graph;
        let seq_len = input_ids.dim(1)?;
        if seq_len > self.config.max_length {
            return Err(FinetuneError::Model(format!(
                "sequence of {} tokens exceeds {}",
                seq_len, self.config.max_length
            )));
        }
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let hidden = g
            .forward(TOKEN_EMBEDDING, input_ids)?
            .broadcast_add(&g.forward("embeddings.position_embedding", &positions)?)?;

        let q = g.forward("encoder.layers.0.self_attn.q_proj", &hidden)?;
        let k = g.forward("encoder.layers.0.self_attn.k_proj", &hidden)?;
        let v = g.forward("encoder.layers.0.self_attn.v_proj", &hidden)?;
        let attn = attention(&q, &k, &v)?;
        let hidden = (&hidden + g.forward("encoder.layers.0.self_attn.out_proj", &attn)?)?;

        let mlp = g.forward("encoder.layers.0.mlp.fc1", &hidden)?.gelu()?;
        Ok((&hidden + g.forward("encoder.layers.0.mlp.fc2", &mlp)?)?)
    }

    fn token_embedding_path(&self) -> Option<&str> {
        Some(TOKEN_EMBEDDING)
    }
}

/// Average-pool downsampling followed by a frozen 1x1 projection.
pub struct TinyVae {
    graph: LayerGraph,
    downsample: usize,
    dtype: DType,
}

impl TinyVae {
    pub fn new(
        latent_channels: usize,
        downsample: usize,
        rng: &mut impl Rng,
        device: &Device,
    ) -> Result<Self> {
        let op = LayerOp::Conv2d {
            in_channels: 3,
            out_channels: latent_channels,
            kernel: 1,
            stride: 1,
            padding: 0,
        };
        let mut graph = LayerGraph::new();
        graph.push("encoder.quant_conv", "Encoder", init_layer(rng, op, true, device)?)?;
        Ok(Self {
            graph,
            downsample: downsample.max(1),
            dtype: DType::F32,
        })
    }

    pub fn downsample(&self) -> usize {
        self.downsample
    }
}

impl ImageEncoder for TinyVae {
    fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = pixel_values.to_dtype(self.dtype)?;
        let x = if self.downsample > 1 {
            x.avg_pool2d(self.downsample)?
        } else {
            x
        };
        self.graph.forward("encoder.quant_conv", &x)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn cast(&mut self, dtype: DType) -> Result<()> {
        let graph = std::mem::take(&mut self.graph);
        self.graph = graph.cast_frozen(dtype)?;
        self.dtype = dtype;
        Ok(())
    }
}

/// Whitespace tokenizer hashing words into a fixed vocabulary.
///
/// Ids 0, 1 and 2 are padding, start and end of text. Added tokens take ids
/// from the top of the vocabulary downwards.
#[derive(Debug, Clone)]
pub struct HashTokenizer {
    vocab_size: usize,
    max_length: usize,
    added: HashMap<String, u32>,
}

const PAD_ID: u32 = 0;
const BOS_ID: u32 = 1;
const EOS_ID: u32 = 2;
const MAX_ADDED_TOKENS: usize = 4;

impl HashTokenizer {
    pub fn new(vocab_size: usize, max_length: usize) -> Result<Self> {
        if vocab_size <= 3 + MAX_ADDED_TOKENS + 1 {
            return Err(FinetuneError::config(format!(
                "vocabulary of {} is too small",
                vocab_size
            )));
        }
        if max_length < 2 {
            return Err(FinetuneError::config("max_length must hold start and end tokens"));
        }
        Ok(Self {
            vocab_size,
            max_length,
            added: HashMap::new(),
        })
    }

    /// Registers a new token. Fails if the token is already known.
    pub fn add_token(&mut self, token: &str) -> Result<u32> {
        let key = token.to_lowercase();
        if self.added.contains_key(&key) {
            return Err(FinetuneError::config(format!(
                "the tokenizer already contains the token {}",
                token
            )));
        }
        if self.added.len() >= MAX_ADDED_TOKENS {
            return Err(FinetuneError::config("no room left for added tokens"));
        }
        let id = (self.vocab_size - 1 - self.added.len()) as u32;
        self.added.insert(key, id);
        Ok(id)
    }

    fn hashed_id(&self, word: &str) -> u32 {
        // FNV-1a
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let span = (self.vocab_size - 3 - MAX_ADDED_TOKENS) as u64;
        3 + (hash % span) as u32
    }
}

impl PromptTokenizer for HashTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = vec![BOS_ID];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            match self.added.get(&word) {
                Some(&id) => ids.push(id),
                None => ids.push(self.hashed_id(&word)),
            }
        }
        ids.truncate(self.max_length - 1);
        ids.push(EOS_ID);
        ids
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn pad_id(&self) -> u32 {
        PAD_ID
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        let key = token.to_lowercase();
        match self.added.get(&key) {
            Some(&id) => Some(id),
            None if key.split_whitespace().count() == 1 => Some(self.hashed_id(&key)),
            None => None,
        }
    }
}
