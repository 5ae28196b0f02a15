/// Component factory driven by the typed configuration
///
/// `ConfigBuilder` turns a `Config` into the model, data loaders, optimizer,
/// scheduler, criterion and metrics of a run. `build` assembles all of them
/// in the order the training driver needs.
use std::path::PathBuf;

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{Config, Split};
use crate::data::{BatchDataLoader, DepthDataLoader, DepthDataset};
use crate::models::{CbamDepthNet, DataParallel, DepthModel};
use crate::training::criterion::{Criterion, DepthCriterion};
use crate::training::metrics::{DepthMetrics, Metrics};
use crate::training::optimizer::DepthOptimizer;
use crate::training::scheduler::{self, LrScheduler};
use crate::DepthError;

/// Pick the primary device of a run
///
/// Multi-device runs fall back to the CPU when no CUDA device is present;
/// single-device runs require CUDA.
pub fn select_device(multigpu: bool) -> crate::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if multigpu {
        log::warn!("No CUDA device available, running data-parallel on CPU");
        Ok(Device::Cpu)
    } else {
        Err(DepthError::Environment(
            "No GPUs, cannot initialize training.".to_string(),
        ))
    }
}

/// Process-scoped context built once at startup
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub device: Device,
}

impl RunContext {
    pub fn new(config: Config) -> crate::Result<Self> {
        let device = select_device(config.trainer.multigpu)?;
        log::info!("Using device: {:?}", device);
        Ok(Self { config, device })
    }
}

/// Everything the trainer drives
pub struct TrainingComponents {
    pub model: Box<dyn DepthModel>,
    /// Variables of the un-wrapped model; the optimizer is bound to these
    pub varmap: VarMap,
    pub optimizer: DepthOptimizer,
    pub scheduler: Option<Box<dyn LrScheduler>>,
    pub criterion: Box<dyn Criterion>,
    pub metrics: Box<dyn Metrics>,
    pub train_loader: Box<dyn BatchDataLoader>,
    pub test_loader: Box<dyn BatchDataLoader>,
}

/// Builds run components from a `Config`
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the model, registering its variables in `varmap`
    pub fn get_model(&self, varmap: &VarMap, device: &Device) -> crate::Result<CbamDepthNet> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Ok(CbamDepthNet::new(self.config.model.clone(), vb)?)
    }

    pub fn multigpu(&self) -> bool {
        self.config.trainer.multigpu
    }

    /// Load the dataset of `split`; only the train split is shuffled
    pub fn get_dataloader(&self, split: Split) -> crate::Result<DepthDataLoader> {
        let dataset_config = &self.config.dataset;
        let dataset = DepthDataset::from_directory(
            dataset_config.split_dir(split),
            dataset_config.depth_min,
            dataset_config.depth_max,
        )?;
        let shuffle = dataset_config.shuffle && split == Split::Train;
        let loader = DepthDataLoader::new(dataset, dataset_config.batch_size_for(split), shuffle);
        log::info!("{} dataloader: {} batches", split, loader.num_batches());
        Ok(loader)
    }

    pub fn get_max_epoch(&self) -> usize {
        self.config.trainer.max_epoch
    }

    pub fn get_stats_dir(&self) -> PathBuf {
        self.config.stats_dir()
    }

    pub fn get_resume_lr(&self) -> Option<f64> {
        self.config.trainer.resume_lr
    }

    /// Create the optimizer over `vars`
    ///
    /// When resuming, `resume_lr` (if set) replaces the configured rate.
    pub fn get_optimizer(
        &self,
        vars: Vec<Var>,
        resume: bool,
        resume_lr: Option<f64>,
    ) -> crate::Result<DepthOptimizer> {
        let lr = match (resume, resume_lr) {
            (true, Some(lr)) => lr,
            _ => self.config.optimizer.lr,
        };
        Ok(DepthOptimizer::new(vars, &self.config.optimizer, lr)?)
    }

    /// Create the configured scheduler, if any, and apply its current rate to
    /// `optimizer`
    ///
    /// When resuming, the schedule starts at the epoch after `resume_epoch`.
    /// With `resume_lr` set, the optimizer's rate is the rate at that epoch and
    /// only later milestones decay it. Otherwise the schedule scales from the
    /// optimizer's rate and is fast-forwarded past every completed epoch.
    pub fn get_lr_scheduler(
        &self,
        optimizer: &mut DepthOptimizer,
        resume: bool,
        resume_epoch: Option<usize>,
    ) -> Option<Box<dyn LrScheduler>> {
        let config = self.config.lr_scheduler.as_ref()?;
        let start_epoch = match (resume, resume_epoch) {
            (true, Some(epoch)) => epoch + 1,
            _ => 0,
        };
        let scheduler = if resume && self.get_resume_lr().is_some() {
            scheduler::anchored(config, optimizer.learning_rate(), start_epoch)
        } else {
            scheduler::from_config(config, optimizer.learning_rate(), start_epoch)
        };
        optimizer.set_learning_rate(scheduler.get_last_lr());
        Some(scheduler)
    }

    pub fn get_criterion(&self) -> Box<dyn Criterion> {
        Box::new(DepthCriterion::new(self.config.criterion.clone()))
    }

    pub fn get_metrics(&self) -> Box<dyn Metrics> {
        Box::new(DepthMetrics::new(self.config.metrics.clone()))
    }

    /// Assemble every component of a run
    ///
    /// The optimizer is bound to the model's variables before the model is
    /// wrapped for data-parallel execution.
    ///
    /// # Arguments
    /// * `device` - Primary device
    /// * `resume_epoch` - Index of the last completed epoch when resuming
    pub fn build(&self, device: &Device, resume_epoch: Option<usize>) -> crate::Result<TrainingComponents> {
        log::info!("Building models ...");
        let varmap = VarMap::new();
        let model = self.get_model(&varmap, device)?;

        log::info!("Building dataloaders ...");
        let train_loader = self.get_dataloader(Split::Train)?;
        let test_loader = self.get_dataloader(Split::Test)?;

        log::info!("Building optimizer and learning rate schedulers ...");
        let resume = resume_epoch.is_some();
        let mut optimizer = self.get_optimizer(varmap.all_vars(), resume, self.get_resume_lr())?;
        let scheduler = self.get_lr_scheduler(&mut optimizer, resume, resume_epoch);

        let model: Box<dyn DepthModel> = if self.multigpu() {
            Box::new(DataParallel::new(model, self.config.trainer.replicas))
        } else {
            Box::new(model)
        };

        Ok(TrainingComponents {
            model,
            varmap,
            optimizer,
            scheduler,
            criterion: self.get_criterion(),
            metrics: self.get_metrics(),
            train_loader: Box::new(train_loader),
            test_loader: Box::new(test_loader),
        })
    }
}
