//! Checkpoint/resume protocol of the training driver, end to end on CPU

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::{Array3, Array4};

use cbam_depth::config::{Config, CriterionConfig, MetricsConfig, ModelConfig, OptimizerConfig};
use cbam_depth::data::{BatchDataLoader, DatasetMetadata, DepthBatch, DepthDataLoader, DepthDataset};
use cbam_depth::models::loader::load_model;
use cbam_depth::models::{CbamDepthNet, DataParallel, DepthModel, ExecutionMode};
use cbam_depth::training::checkpoint::{
    epoch_checkpoint_name, Checkpoint, CheckpointManager, CheckpointMetadata, BEST_CHECKPOINT,
};
use cbam_depth::training::criterion::{Criterion, DepthCriterion, LossResult};
use cbam_depth::training::metrics::DepthMetrics;
use cbam_depth::training::optimizer::DepthOptimizer;
use cbam_depth::{Trainer, TrainingComponents};

/// Loss fixed per epoch, still attached to the prediction graph
struct ScriptedCriterion {
    script: Vec<f64>,
    epoch: usize,
}

impl Criterion for ScriptedCriterion {
    fn compute(&self, batch: &DepthBatch) -> candle_core::Result<LossResult> {
        let value = self.script[self.epoch];
        let loss = batch.prediction()?.mean_all()?.affine(0.0, value)?;
        Ok(LossResult::new(loss))
    }

    fn step(&mut self) {
        self.epoch += 1;
    }
}

fn model_config() -> ModelConfig {
    ModelConfig {
        base_channels: 4,
        num_stages: 2,
        reduction: 0.5,
    }
}

fn dataset(n: usize) -> DepthDataset {
    let rgb = Array4::from_shape_fn((n, 3, 8, 8), |(i, c, y, x)| ((i + 2 * c + y * x) % 6) as f32 / 6.0);
    let depth = Array3::from_shape_fn((n, 8, 8), |(i, y, x)| 0.4 + ((3 * i + y + x) % 9) as f32 / 10.0);
    let depth_gt = depth.mapv(|d| d + 0.02);
    DepthDataset::from_arrays(rgb, depth, depth_gt, None, 0.3, 1.5, DatasetMetadata::default())
        .expect("valid dataset")
}

fn components(criterion: Box<dyn Criterion>, multigpu: bool) -> cbam_depth::Result<TrainingComponents> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CbamDepthNet::new(model_config(), vb)?;

    let optimizer = DepthOptimizer::new(varmap.all_vars(), &OptimizerConfig::default(), 1e-2)?;
    let model: Box<dyn DepthModel> = if multigpu {
        Box::new(DataParallel::new(model, 2))
    } else {
        Box::new(model)
    };

    Ok(TrainingComponents {
        model,
        varmap,
        optimizer,
        scheduler: None,
        criterion,
        metrics: Box::new(DepthMetrics::new(MetricsConfig::default())),
        train_loader: Box::new(DepthDataLoader::new(dataset(4), 2, false)),
        test_loader: Box::new(DepthDataLoader::new(dataset(2), 2, false)),
    })
}

fn scripted(script: &[f64]) -> Box<dyn Criterion> {
    Box::new(ScriptedCriterion {
        script: script.to_vec(),
        epoch: 0,
    })
}

/// Run (or resume) a scripted training run in `stats_dir`
fn run(stats_dir: &Path, script: &[f64], max_epoch: usize) -> cbam_depth::Result<Trainer> {
    let device = Device::Cpu;
    let checkpoints = CheckpointManager::new(stats_dir)?;
    let resume_from = checkpoints.load_best(&device)?;

    let mut trainer = Trainer::new(
        components(scripted(script), false)?,
        checkpoints,
        max_epoch,
        device,
        resume_from,
    )?;
    trainer.train()?;
    Ok(trainer)
}

fn best(stats_dir: &Path) -> cbam_depth::Result<CheckpointMetadata> {
    Ok(Checkpoint::load(stats_dir.join(BEST_CHECKPOINT), &Device::Cpu)?.metadata)
}

fn checkpoint_files(stats_dir: &Path) -> cbam_depth::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(stats_dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[test]
fn fresh_run_writes_rolling_and_single_best() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    let trainer = run(dir.path(), &[1.0, 0.5, 0.75], 3)?;

    let expected = vec![
        "checkpoint-epoch0.tar".to_string(),
        "checkpoint-epoch1.tar".to_string(),
        "checkpoint-epoch2.tar".to_string(),
        BEST_CHECKPOINT.to_string(),
    ];
    assert_eq!(checkpoint_files(dir.path())?, expected);

    let best = best(dir.path())?;
    assert_eq!(best.epoch, 2);
    assert_eq!(best.loss, 0.5);
    assert!(best.metrics.contains_key("rmse"));

    assert_eq!(trainer.state().min_loss, 0.5);
    assert_eq!(trainer.state().min_loss_epoch, Some(2));

    let rolling = Checkpoint::load(dir.path().join(epoch_checkpoint_name(2)), &Device::Cpu)?;
    assert_eq!(rolling.metadata.epoch, 3);
    assert_eq!(rolling.metadata.loss, 0.75);
    Ok(())
}

#[test]
fn resume_continues_after_best_epoch() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    // Best at epoch index 1
    run(dir.path(), &[1.0, 0.5, 0.7], 3)?;

    let device = Device::Cpu;
    let checkpoints = CheckpointManager::new(dir.path())?;
    let resume_from = checkpoints.load_best(&device)?;
    let trainer = Trainer::new(
        components(scripted(&[1.0, 0.5, 0.6, 0.4]), false)?,
        checkpoints,
        4,
        device,
        resume_from,
    )?;

    assert_eq!(trainer.state().start_epoch, 2);
    assert_eq!(trainer.state().min_loss, 0.5);
    assert_eq!(trainer.state().min_loss_epoch, Some(2));
    Ok(())
}

#[test]
fn resumed_loss_only_replaces_best_when_lower() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    run(dir.path(), &[1.0, 0.5], 2)?;
    assert_eq!(best(dir.path())?.loss, 0.5);

    // Epoch 2 is not better, the best file must stay untouched
    let trainer = run(dir.path(), &[1.0, 0.5, 0.5], 3)?;
    assert!(dir.path().join("checkpoint-epoch2.tar").exists());
    let kept = best(dir.path())?;
    assert_eq!(kept.epoch, 2);
    assert_eq!(kept.loss, 0.5);
    assert_eq!(trainer.state().min_loss_epoch, Some(2));

    // Resumed from epoch 2 again; epoch 3 improves
    let trainer = run(dir.path(), &[1.0, 0.5, 0.9, 0.25], 4)?;
    let replaced = best(dir.path())?;
    assert_eq!(replaced.epoch, 4);
    assert_eq!(replaced.loss, 0.25);
    assert_eq!(trainer.state().min_loss, 0.25);
    Ok(())
}

#[test]
fn resume_after_crash_between_writes_uses_previous_best() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    run(dir.path(), &[1.0, 0.5], 2)?;

    // Rolling file of a better epoch 2 written, best write never happened
    let device = Device::Cpu;
    let checkpoints = CheckpointManager::new(dir.path())?;
    let previous = Checkpoint::load(checkpoints.best_path(), &device)?;
    let better = Checkpoint::new(
        previous.tensors,
        CheckpointMetadata {
            epoch: 3,
            loss: 0.1,
            metrics: Default::default(),
        },
    );
    checkpoints.save_epoch(2, &better)?;

    let resume_from = checkpoints.load_best(&device)?;
    let trainer = Trainer::new(
        components(scripted(&[1.0, 0.5, 0.1]), false)?,
        checkpoints,
        3,
        device,
        resume_from,
    )?;
    assert_eq!(trainer.state().start_epoch, 2);
    assert_eq!(trainer.state().min_loss, 0.5);
    Ok(())
}

#[test]
fn data_parallel_updates_reach_saved_state() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    let device = Device::Cpu;

    let parts = components(Box::new(DepthCriterion::new(CriterionConfig::default())), true)?;
    let varmap = parts.varmap.clone();
    let initial: HashMap<String, Vec<f32>> = {
        let data = varmap.data().lock().expect("varmap lock");
        data.iter()
            .map(|(name, var)| -> candle_core::Result<(String, Vec<f32>)> {
                Ok((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
            })
            .collect::<candle_core::Result<_>>()?
    };

    let checkpoints = CheckpointManager::new(dir.path())?;
    let mut trainer = Trainer::new(parts, checkpoints, 1, device.clone(), None)?;
    trainer.train()?;

    let saved = Checkpoint::load(dir.path().join(BEST_CHECKPOINT), &device)?;
    assert_eq!(saved.tensors.len(), initial.len());
    let changed = saved.tensors.iter().any(|(name, tensor)| {
        let after = tensor.flatten_all().and_then(|t| t.to_vec1::<f32>());
        matches!(after, Ok(values) if values != initial[name])
    });
    assert!(changed, "saved state must carry the optimizer updates");

    // The saved file is an un-wrapped single model
    let restored = load_model(model_config(), dir.path().join(BEST_CHECKPOINT), &device)?;
    let live = CbamDepthNet::new(model_config(), VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

    let rgb = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), &device)?;
    let depth = Tensor::rand(0f32, 1.0, (2, 8, 8), &device)?;
    let a = restored.forward_t(&rgb, &depth, ExecutionMode::Eval)?;
    let b = live.forward_t(&rgb, &depth, ExecutionMode::Eval)?;
    let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    assert!(diff < 1e-5, "restored model differs by {}", diff);
    Ok(())
}

/// Predicts 0.5 everywhere, shaped like the depth input
struct ConstantModel;

impl DepthModel for ConstantModel {
    fn forward_t(&self, _rgb: &Tensor, depth: &Tensor, _mode: ExecutionMode) -> candle_core::Result<Tensor> {
        Tensor::full(0.5f32, depth.dims(), depth.device())
    }
}

struct RepeatLoader {
    batch: DepthBatch,
    served: bool,
}

impl BatchDataLoader for RepeatLoader {
    fn next_batch(&mut self) -> candle_core::Result<Option<DepthBatch>> {
        if self.served {
            return Ok(None);
        }
        self.served = true;
        Ok(Some(self.batch.clone()))
    }

    fn reset(&mut self) {
        self.served = false;
    }

    fn num_batches(&self) -> usize {
        1
    }
}

#[test]
fn eval_pass_denormalizes_to_depth_range() -> cbam_depth::Result<()> {
    let dir = tempfile::tempdir()?;
    let device = Device::Cpu;

    let batch = DepthBatch {
        rgb: Tensor::zeros((2, 3, 4, 4), DType::F32, &device)?,
        depth: Tensor::zeros((2, 1, 4, 4), DType::F32, &device)?,
        depth_gt: Tensor::full(5.0f32, (2, 1, 4, 4), &device)?,
        depth_gt_mask: Tensor::ones((2, 1, 4, 4), DType::F32, &device)?,
        depth_min: Tensor::zeros(2, DType::F32, &device)?,
        depth_max: Tensor::full(10.0f32, 2, &device)?,
        pred: None,
    };

    let components = TrainingComponents {
        model: Box::new(ConstantModel),
        varmap: VarMap::new(),
        optimizer: DepthOptimizer::new(Vec::new(), &OptimizerConfig::default(), 1e-3)?,
        scheduler: None,
        criterion: Box::new(DepthCriterion::new(CriterionConfig::default())),
        metrics: Box::new(DepthMetrics::new(MetricsConfig::default())),
        train_loader: Box::new(RepeatLoader {
            batch: batch.clone(),
            served: false,
        }),
        test_loader: Box::new(RepeatLoader { batch, served: false }),
    };

    let mut trainer = Trainer::new(components, CheckpointManager::new(dir.path())?, 1, device, None)?;
    let (loss, metrics) = trainer.test_one_epoch(0)?;

    assert!(loss.abs() < 1e-9);
    assert!(metrics["mae"].abs() < 1e-9);
    assert_eq!(metrics["delta1.05"], 1.0);
    Ok(())
}

#[test]
fn shipped_config_is_valid() -> cbam_depth::Result<()> {
    let config = Config::from_file(Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/default.yaml"))?;
    assert_eq!(config.trainer.max_epoch, 40);
    assert!(config.lr_scheduler.is_some());
    Ok(())
}
