/// Epoch-based learning rate schedulers
use std::f64::consts::PI;

use crate::config::SchedulerConfig;

/// Learning rate schedule stepped once per epoch
///
/// `last_epoch` is the epoch whose rate `get_last_lr` returns. A fresh
/// schedule starts at epoch 0; a resumed one starts at the first epoch that
/// still has to run.
pub trait LrScheduler {
    /// Advance to the next epoch
    fn step(&mut self);

    /// Learning rate for `last_epoch`
    fn get_last_lr(&self) -> f64;

    /// Current epoch of the schedule
    fn last_epoch(&self) -> usize;
}

/// Build a scheduler from its configuration
///
/// # Arguments
/// * `config` - Schedule configuration
/// * `base_lr` - Rate the schedule scales from
/// * `start_epoch` - Epoch the schedule is fast-forwarded to
pub fn from_config(config: &SchedulerConfig, base_lr: f64, start_epoch: usize) -> Box<dyn LrScheduler> {
    match config {
        SchedulerConfig::MultiStep { milestones, gamma } => Box::new(MultiStepLr::new(
            base_lr,
            milestones.clone(),
            *gamma,
            start_epoch,
        )),
        SchedulerConfig::Cosine {
            warmup_epochs,
            lr_min,
            total_epochs,
        } => Box::new(CosineScheduler::new(
            CosineSchedulerConfig {
                lr_init: base_lr,
                lr_min: *lr_min,
                warmup_epochs: *warmup_epochs,
                total_epochs: *total_epochs,
            },
            start_epoch,
        )),
    }
}

/// Build a scheduler whose rate at `start_epoch` is `start_lr`
///
/// Used when a resumed run overrides the learning rate: only milestones after
/// `start_epoch` still decay the rate, and a cosine schedule anneals from
/// `start_lr` to `lr_min` over the epochs left until `total_epochs`.
pub fn anchored(config: &SchedulerConfig, start_lr: f64, start_epoch: usize) -> Box<dyn LrScheduler> {
    match config {
        SchedulerConfig::MultiStep { milestones, gamma } => Box::new(MultiStepLr::new(
            start_lr,
            milestones.iter().copied().filter(|&m| m > start_epoch).collect(),
            *gamma,
            start_epoch,
        )),
        SchedulerConfig::Cosine {
            lr_min,
            total_epochs,
            ..
        } => Box::new(CosineScheduler::anchored(
            CosineSchedulerConfig {
                lr_init: start_lr,
                lr_min: *lr_min,
                warmup_epochs: 0,
                total_epochs: total_epochs.saturating_sub(start_epoch),
            },
            start_epoch,
        )),
    }
}

/// Step decay: the base rate is multiplied by `gamma` once for every
/// milestone already reached
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64, start_epoch: usize) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            last_epoch: start_epoch,
        }
    }

    /// Get learning rate for a specific epoch
    pub fn get_lr_at_epoch(&self, epoch: usize) -> f64 {
        let decays = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(decays as i32)
    }
}

impl LrScheduler for MultiStepLr {
    fn step(&mut self) {
        self.last_epoch += 1;
    }

    fn get_last_lr(&self) -> f64 {
        self.get_lr_at_epoch(self.last_epoch)
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}

/// Cosine annealing learning rate scheduler configuration
#[derive(Debug, Clone)]
pub struct CosineSchedulerConfig {
    /// Initial learning rate
    pub lr_init: f64,
    /// Minimum learning rate (at end of schedule)
    pub lr_min: f64,
    /// Number of warmup epochs
    pub warmup_epochs: usize,
    /// Epoch at which the rate reaches `lr_min`
    pub total_epochs: usize,
}

/// Cosine learning rate scheduler
///
/// - Linear warmup reaching lr_init at the last warmup epoch
/// - Cosine annealing from lr_init to lr_min over the remaining epochs
pub struct CosineScheduler {
    config: CosineSchedulerConfig,
    /// Epoch the schedule's own epoch 0 is mapped to
    origin: usize,
    last_epoch: usize,
}

impl CosineScheduler {
    pub fn new(config: CosineSchedulerConfig, start_epoch: usize) -> Self {
        Self {
            config,
            origin: 0,
            last_epoch: start_epoch,
        }
    }

    /// Schedule that begins at `start_epoch` rather than epoch 0
    ///
    /// `config.total_epochs` counts from `start_epoch`.
    pub fn anchored(config: CosineSchedulerConfig, start_epoch: usize) -> Self {
        Self {
            config,
            origin: start_epoch,
            last_epoch: start_epoch,
        }
    }

    /// Get learning rate for a specific epoch
    pub fn get_lr_at_epoch(&self, epoch: usize) -> f64 {
        let epoch = epoch.saturating_sub(self.origin);
        let warmup = self.config.warmup_epochs;
        if epoch < warmup {
            return self.config.lr_init * ((epoch + 1) as f64 / warmup as f64);
        }

        let span = self.config.total_epochs.saturating_sub(warmup).max(1);
        let progress = ((epoch - warmup) as f64 / span as f64).clamp(0.0, 1.0);

        let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
        self.config.lr_min + (self.config.lr_init - self.config.lr_min) * cosine_factor
    }
}

impl LrScheduler for CosineScheduler {
    fn step(&mut self) {
        self.last_epoch += 1;
    }

    fn get_last_lr(&self) -> f64 {
        self.get_lr_at_epoch(self.last_epoch)
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }
}
