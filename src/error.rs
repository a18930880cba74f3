//! Error taxonomy for the fine-tuning core

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum FinetuneError {
    /// Rejected before any compute is scheduled.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Loss became non-finite. Never recovered.
    #[error("loss diverged at step {step}: {value}")]
    NumericDivergence { step: usize, value: f32 },

    #[error("failed to persist {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    #[error("distributed error: {0}")]
    Distributed(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl FinetuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
