/// Epoch loop and checkpoint/resume driver for depth completion
use std::time::Instant;

use candle_core::Device;
use candle_nn::VarMap;

use super::checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
use super::criterion::{Criterion, SMOOTH_TERM};
use super::metrics::{display_results, Metrics, MetricsResult};
use super::optimizer::DepthOptimizer;
use super::scheduler::LrScheduler;
use crate::builder::{ConfigBuilder, TrainingComponents};
use crate::data::BatchDataLoader;
use crate::models::{DepthModel, ExecutionMode};
use crate::DepthError;

/// Best-loss bookkeeping of a run
///
/// Epochs here count completed epochs, matching the `epoch` stored in
/// checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// First epoch index still to run
    pub start_epoch: usize,
    /// Lowest test loss seen so far
    pub min_loss: f64,
    /// Completed-epoch count at which `min_loss` was reached
    pub min_loss_epoch: Option<usize>,
}

impl TrainingState {
    pub fn fresh() -> Self {
        Self {
            start_epoch: 0,
            min_loss: f64::INFINITY,
            min_loss_epoch: None,
        }
    }

    /// State continuing from a stored best checkpoint
    pub fn resumed(metadata: &CheckpointMetadata) -> Self {
        Self {
            start_epoch: metadata.epoch,
            min_loss: metadata.loss,
            min_loss_epoch: Some(metadata.epoch),
        }
    }

    /// Record the test loss of epoch index `epoch`; true when it is a new best
    pub fn record(&mut self, epoch: usize, loss: f64) -> bool {
        if loss < self.min_loss {
            self.min_loss = loss;
            self.min_loss_epoch = Some(epoch + 1);
            true
        } else {
            false
        }
    }
}

/// Outcome of `Trainer::train`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub min_loss: f64,
    pub min_loss_epoch: Option<usize>,
    pub epochs_run: usize,
}

fn mean(values: &[f64], what: &str) -> crate::Result<f64> {
    if values.is_empty() {
        return Err(DepthError::Training(format!("{} dataloader yielded no batches", what)));
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

fn log_batch(epoch: usize, index: usize, total: usize, loss: f64, smooth: Option<f64>) {
    match smooth {
        Some(s) => log::info!(
            "Epoch {}, batch {}/{}, loss: {:.8}, smooth loss: {:.8}",
            epoch + 1,
            index,
            total,
            loss,
            s
        ),
        None => log::info!("Epoch {}, batch {}/{}, loss: {:.8}", epoch + 1, index, total, loss),
    }
}

/// Trainer for depth completion models
pub struct Trainer {
    model: Box<dyn DepthModel>,
    varmap: VarMap,
    optimizer: DepthOptimizer,
    scheduler: Option<Box<dyn LrScheduler>>,
    criterion: Box<dyn Criterion>,
    metrics: Box<dyn Metrics>,
    train_loader: Box<dyn BatchDataLoader>,
    test_loader: Box<dyn BatchDataLoader>,
    checkpoints: CheckpointManager,
    device: Device,
    max_epoch: usize,
    state: TrainingState,
}

impl Trainer {
    /// Create new trainer
    ///
    /// When resuming, the criterion is stepped once per completed epoch so its
    /// epoch-staged terms match `start_epoch`. The Python training script this
    /// trainer follows builds a fresh criterion on resume and never replays it.
    ///
    /// # Arguments
    /// * `components` - Model, optimizer and collaborators, already built for
    ///   the resume epoch when resuming
    /// * `checkpoints` - Checkpoint files of the stats directory
    /// * `max_epoch` - Exclusive upper bound of the epoch loop
    /// * `device` - Device every batch is moved to
    /// * `resume_from` - Best checkpoint to continue from, if any
    pub fn new(
        components: TrainingComponents,
        checkpoints: CheckpointManager,
        max_epoch: usize,
        device: Device,
        resume_from: Option<Checkpoint>,
    ) -> crate::Result<Self> {
        let TrainingComponents {
            model,
            varmap,
            optimizer,
            scheduler,
            mut criterion,
            metrics,
            train_loader,
            test_loader,
        } = components;

        let state = match &resume_from {
            Some(checkpoint) => {
                checkpoint.restore_into(&varmap)?;
                let state = TrainingState::resumed(&checkpoint.metadata);
                for _ in 0..state.start_epoch {
                    criterion.step();
                }
                log::info!(
                    "Checkpoint {} (epoch {}) loaded.",
                    checkpoints.best_path().display(),
                    state.start_epoch
                );
                display_results(&checkpoint.metadata.metrics);
                state
            }
            None => TrainingState::fresh(),
        };

        Ok(Self {
            model,
            varmap,
            optimizer,
            scheduler,
            criterion,
            metrics,
            train_loader,
            test_loader,
            checkpoints,
            device,
            max_epoch,
            state,
        })
    }

    /// Build a trainer from configuration, resuming from the stats
    /// directory's best checkpoint when one exists
    pub fn from_builder(builder: &ConfigBuilder, device: Device) -> crate::Result<Self> {
        log::info!("Checking checkpoints ...");
        let checkpoints = CheckpointManager::new(builder.get_stats_dir())?;
        let resume_from = checkpoints.load_best(&device)?;
        let resume_epoch = resume_from
            .as_ref()
            .and_then(|c| c.metadata.epoch.checked_sub(1));

        let components = builder.build(&device, resume_epoch)?;
        Self::new(
            components,
            checkpoints,
            builder.get_max_epoch(),
            device,
            resume_from,
        )
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &DepthOptimizer {
        &self.optimizer
    }

    pub fn criterion(&self) -> &dyn Criterion {
        self.criterion.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run one training pass over the train loader
    ///
    /// # Returns
    /// Mean training loss of the epoch
    pub fn train_one_epoch(&mut self, epoch: usize) -> crate::Result<f64> {
        log::info!("Start training process in epoch {}.", epoch + 1);
        if let Some(scheduler) = &self.scheduler {
            log::info!("Learning rate: {}.", scheduler.get_last_lr());
        }

        self.train_loader.reset();
        let total = self.train_loader.num_batches();
        let mut losses = Vec::with_capacity(total);

        while let Some(batch) = self.train_loader.next_batch()? {
            let mut batch = batch.to_device(&self.device)?;
            let raw = self
                .model
                .forward_t(&batch.rgb, &batch.depth, ExecutionMode::Train)?;
            batch.attach_prediction(&raw)?;

            let result = self.criterion.compute(&batch)?;
            self.optimizer.backward_step(&result.loss)?;

            let loss = result.loss_value()?;
            log_batch(epoch, losses.len() + 1, total, loss, result.term_value(SMOOTH_TERM)?);
            losses.push(loss);
        }

        let mean_loss = mean(&losses, "train")?;
        log::info!(
            "Finish training process in epoch {}, mean training loss: {:.8}",
            epoch + 1,
            mean_loss
        );
        Ok(mean_loss)
    }

    /// Run one evaluation pass over the test loader
    ///
    /// # Returns
    /// Mean test loss and the metrics recorded over the pass
    pub fn test_one_epoch(&mut self, epoch: usize) -> crate::Result<(f64, MetricsResult)> {
        log::info!("Start testing process in epoch {}.", epoch + 1);
        self.metrics.clear();

        self.test_loader.reset();
        let total = self.test_loader.num_batches();
        let mut losses = Vec::with_capacity(total);
        let mut running_time = Vec::with_capacity(total);

        while let Some(batch) = self.test_loader.next_batch()? {
            let mut batch = batch.to_device(&self.device)?;

            let time_start = Instant::now();
            let raw = self
                .model
                .forward_t(&batch.rgb, &batch.depth, ExecutionMode::Eval)?;
            let duration = time_start.elapsed().as_secs_f64();

            batch.attach_prediction(&raw.detach())?;
            let result = self.criterion.compute(&batch)?;
            self.metrics.evaluate_batch(&batch, true)?;

            let loss = result.loss_value()?;
            log_batch(epoch, losses.len() + 1, total, loss, result.term_value(SMOOTH_TERM)?);
            losses.push(loss);
            running_time.push(duration);
        }

        let mean_loss = mean(&losses, "test")?;
        let avg_running_time = mean(&running_time, "test")?;
        log::info!(
            "Finish testing process in epoch {}, mean testing loss: {:.8}, average running time: {:.4}s",
            epoch + 1,
            mean_loss,
            avg_running_time
        );

        let results = self.metrics.get_results();
        self.metrics.display_results();
        Ok((mean_loss, results))
    }

    /// Snapshot the model and write the rolling checkpoint of `epoch`, then
    /// the best checkpoint if `loss` improves on the best so far
    fn save_checkpoints(&mut self, epoch: usize, loss: f64, metrics: MetricsResult) -> crate::Result<()> {
        let checkpoint = Checkpoint::from_varmap(
            &self.varmap,
            CheckpointMetadata {
                epoch: epoch + 1,
                loss,
                metrics,
            },
        )?;

        self.checkpoints.save_epoch(epoch, &checkpoint)?;
        if self.state.record(epoch, loss) {
            let path = self.checkpoints.save_best(&checkpoint)?;
            log::info!("New best testing loss {:.8}, saved to {}", loss, path.display());
        }
        Ok(())
    }

    /// Full training loop from `start_epoch` to `max_epoch`
    pub fn train(&mut self) -> crate::Result<TrainingSummary> {
        let start_epoch = self.state.start_epoch;

        for epoch in start_epoch..self.max_epoch {
            log::info!("--> Epoch {}/{}", epoch + 1, self.max_epoch);

            self.train_one_epoch(epoch)?;
            let (loss, metrics) = self.test_one_epoch(epoch)?;

            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step();
                self.optimizer.set_learning_rate(scheduler.get_last_lr());
            }
            self.criterion.step();

            self.save_checkpoints(epoch, loss, metrics)?;
        }

        let min_loss_epoch = match self.state.min_loss_epoch {
            Some(e) => e.to_string(),
            None => "-".to_string(),
        };
        log::info!(
            "Training Finished. Min testing loss: {:.6}, in epoch {}",
            self.state.min_loss,
            min_loss_epoch
        );

        Ok(TrainingSummary {
            min_loss: self.state.min_loss,
            min_loss_epoch: self.state.min_loss_epoch,
            epochs_run: self.max_epoch.saturating_sub(start_epoch),
        })
    }
}
