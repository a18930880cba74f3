//! Model interfaces consumed by the training core
//!
//! The core never builds architectures itself. It only needs each network's
//! [`LayerGraph`] (to carve trainable parameters and inject adapters) and a
//! forward pass.

pub mod layers;
pub mod lora;
pub mod tiny;
pub mod weights;

use candle_core::{DType, Tensor};

use crate::error::Result;

pub use layers::{BaseLayer, Layer, LayerGraph, LayerOp, NamedLayer, Param};
pub use lora::{AdaptedLayer, AdapterSet, LoraTarget};
pub use tiny::{HashTokenizer, TinyTextEncoder, TinyUNet, TinyVae};

/// Predicts the noise (or velocity) residual of noisy latents.
pub trait DenoisingModel {
    fn name(&self) -> &str {
        "unet"
    }

    fn layers(&self) -> &LayerGraph;

    fn layers_mut(&mut self) -> &mut LayerGraph;

    /// `noisy_latents` is `[B, C, H, W]`, `timesteps` is `[B]`,
    /// `encoder_hidden_states` is `[B, L, D]`.
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor>;
}

/// Maps padded token ids `[B, L]` to hidden states `[B, L, D]`.
pub trait TextEncoderModel {
    fn name(&self) -> &str {
        "text_encoder"
    }

    fn layers(&self) -> &LayerGraph;

    fn layers_mut(&mut self) -> &mut LayerGraph;

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Path of the token embedding layer, if the encoder has one.
    fn token_embedding_path(&self) -> Option<&str> {
        None
    }
}

/// Frozen image-to-latent encoder.
pub trait ImageEncoder {
    fn encode(&self, pixel_values: &Tensor) -> Result<Tensor>;

    fn scaling_factor(&self) -> f64 {
        0.18215
    }

    /// Storage dtype of the encoder weights; inputs are fed in this dtype.
    fn dtype(&self) -> DType;

    fn cast(&mut self, dtype: DType) -> Result<()>;
}

/// Prompt to fixed-length token ids.
pub trait PromptTokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn max_length(&self) -> usize;

    fn pad_id(&self) -> u32;

    fn token_id(&self, token: &str) -> Option<u32>;

    /// Encodes then pads or truncates to `max_length`.
    fn encode_padded(&self, text: &str) -> Vec<u32> {
        let mut ids = self.encode(text);
        ids.truncate(self.max_length());
        ids.resize(self.max_length(), self.pad_id());
        ids
    }
}
