//! CBAM depth completion - training on candle
//!
//! Predicts a dense depth map from an RGB image and a sparse or noisy depth
//! map, and drives the train/eval loop that fits such a model.
//!
//! # Architecture
//!
//! - **Attention**: CBAM blocks (channel gate followed by spatial gate)
//! - **Backbone**: encoder/decoder with a CBAM block per encoder stage
//! - **Training**: epoch loop, LR scheduling, staged criterion, metrics
//! - **Checkpoints**: rolling per-epoch files plus a best-loss file, used for resume
//!
//! # Example
//!
//! ```ignore
//! use cbam_depth::{Config, ConfigBuilder, Trainer};
//!
//! let config = Config::from_file("configs/default.yaml")?;
//! let builder = ConfigBuilder::new(config);
//! let mut trainer = Trainer::from_builder(&builder, device)?;
//! let summary = trainer.train()?;
//! ```

pub mod builder;
pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;

// Re-export commonly used items
pub use builder::{ConfigBuilder, RunContext, TrainingComponents};
pub use config::Config;
pub use data::DepthBatch;
pub use layers::{Cbam, ChannelAttention, SpatialAttention};
pub use models::{CbamDepthNet, DepthModel, ExecutionMode};
pub use training::{Trainer, TrainingSummary};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum DepthError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, DepthError>;
