/// Training infrastructure for depth completion

pub mod checkpoint;
pub mod criterion;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use criterion::{Criterion, DepthCriterion, LossResult};
pub use metrics::{DepthMetrics, Metrics, MetricsResult};
pub use optimizer::DepthOptimizer;
pub use scheduler::{CosineScheduler, LrScheduler, MultiStepLr};
pub use trainer::{Trainer, TrainingState, TrainingSummary};
