/// Run configuration
///
/// Every section has defaults, so a YAML file only needs the keys it overrides.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Complete configuration for a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    /// No scheduler means a constant learning rate
    pub lr_scheduler: Option<SchedulerConfig>,
    pub dataset: DatasetConfig,
    pub criterion: CriterionConfig,
    pub metrics: MetricsConfig,
    pub trainer: TrainerConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

/// Backbone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Channels after the stem; doubled by every encoder stage
    pub base_channels: usize,
    /// Number of stride-2 encoder stages (each followed by a CBAM block)
    pub num_stages: usize,
    /// Channel attention bottleneck ratio, in (0, 1]
    pub reduction: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_channels: 32,
            num_stages: 3,
            reduction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[serde(rename = "adamw")]
    AdamW,
    Sgd,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            lr: 1e-3,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Epoch-based learning rate schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Multiply the rate by `gamma` at every milestone epoch
    MultiStep { milestones: Vec<usize>, gamma: f64 },
    /// Linear warmup, then cosine decay to `lr_min` at `total_epochs`
    Cosine {
        #[serde(default)]
        warmup_epochs: usize,
        lr_min: f64,
        total_epochs: usize,
    },
}

/// Dataset splits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Root directory holding one subdirectory per split
    pub data_dir: PathBuf,
    pub train_split: String,
    pub test_split: String,
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub shuffle: bool,
    /// Depth clipping range in metres; also the denormalization range
    pub depth_min: f32,
    pub depth_max: f32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            train_split: "train".to_string(),
            test_split: "test".to_string(),
            batch_size: 4,
            test_batch_size: 1,
            shuffle: true,
            depth_min: 0.3,
            depth_max: 1.5,
        }
    }
}

impl DatasetConfig {
    pub fn split_dir(&self, split: Split) -> PathBuf {
        match split {
            Split::Train => self.data_dir.join(&self.train_split),
            Split::Test => self.data_dir.join(&self.test_split),
        }
    }

    pub fn batch_size_for(&self, split: Split) -> usize {
        match split {
            Split::Train => self.batch_size,
            Split::Test => self.test_batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Mse,
    MaskedMse,
    L1,
    MaskedL1,
}

/// Criterion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriterionConfig {
    #[serde(rename = "type")]
    pub kind: LossKind,
    /// Added to the mask sum of masked losses
    pub epsilon: f64,
    /// Weight of the smoothness term; 0 disables it
    pub smooth_weight: f64,
    /// First epoch (0-based) at which the smoothness term joins the loss
    pub smooth_start_epoch: usize,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::MaskedMse,
            epsilon: 1e-8,
            smooth_weight: 0.0,
            smooth_start_epoch: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "mse")]
    Mse,
    #[serde(rename = "rmse")]
    Rmse,
    #[serde(rename = "rel")]
    Rel,
    #[serde(rename = "mae")]
    Mae,
    #[serde(rename = "delta1.05")]
    Delta105,
    #[serde(rename = "delta1.10")]
    Delta110,
    #[serde(rename = "delta1.25")]
    Delta125,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::Mse,
        MetricKind::Rmse,
        MetricKind::Rel,
        MetricKind::Mae,
        MetricKind::Delta105,
        MetricKind::Delta110,
        MetricKind::Delta125,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Mse => "mse",
            MetricKind::Rmse => "rmse",
            MetricKind::Rel => "rel",
            MetricKind::Mae => "mae",
            MetricKind::Delta105 => "delta1.05",
            MetricKind::Delta110 => "delta1.10",
            MetricKind::Delta125 => "delta1.25",
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub types: Vec<MetricKind>,
    pub epsilon: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            types: MetricKind::ALL.to_vec(),
            epsilon: 1e-8,
        }
    }
}

/// Trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epoch: usize,
    pub multigpu: bool,
    /// Number of data-parallel replicas when `multigpu` is set
    pub replicas: usize,
    /// Learning rate to restart from when resuming
    pub resume_lr: Option<f64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epoch: 40,
            multigpu: false,
            replicas: 2,
            resume_lr: None,
        }
    }
}

/// Where checkpoints are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub stats_dir: PathBuf,
    pub stats_exper: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            stats_dir: PathBuf::from("stats"),
            stats_exper: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `env_logger` filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::DepthError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML configuration string
    pub fn from_yaml(contents: &str) -> crate::Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        let err = |msg: String| Err(crate::DepthError::Config(msg));

        if self.model.base_channels == 0 {
            return err("model.base_channels must be > 0".to_string());
        }

        if !(self.model.reduction > 0.0 && self.model.reduction <= 1.0) {
            return err(format!(
                "model.reduction must be in (0, 1], got {}",
                self.model.reduction
            ));
        }

        if self.optimizer.lr <= 0.0 {
            return err("optimizer.lr must be > 0".to_string());
        }

        if self.dataset.batch_size == 0 || self.dataset.test_batch_size == 0 {
            return err("dataset batch sizes must be > 0".to_string());
        }

        if !(self.dataset.depth_min >= 0.0 && self.dataset.depth_max > self.dataset.depth_min) {
            return err(format!(
                "dataset depth range [{}, {}] is invalid",
                self.dataset.depth_min, self.dataset.depth_max
            ));
        }

        if self.criterion.smooth_weight < 0.0 {
            return err("criterion.smooth_weight must be >= 0".to_string());
        }

        if self.trainer.multigpu && self.trainer.replicas == 0 {
            return err("trainer.replicas must be > 0 with multigpu".to_string());
        }

        match &self.lr_scheduler {
            Some(SchedulerConfig::MultiStep { milestones, gamma }) => {
                if *gamma <= 0.0 {
                    return err("lr_scheduler.gamma must be > 0".to_string());
                }
                if milestones.windows(2).any(|w| w[0] >= w[1]) {
                    return err("lr_scheduler.milestones must be strictly increasing".to_string());
                }
            }
            Some(SchedulerConfig::Cosine {
                warmup_epochs,
                total_epochs,
                lr_min,
            }) => {
                if warmup_epochs >= total_epochs {
                    return err("lr_scheduler.warmup_epochs must be < total_epochs".to_string());
                }
                if *lr_min > self.optimizer.lr {
                    return err("lr_scheduler.lr_min must not exceed optimizer.lr".to_string());
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Directory for this experiment's checkpoints
    pub fn stats_dir(&self) -> PathBuf {
        self.stats.stats_dir.join(&self.stats.stats_exper)
    }
}
