/// Loss computation for depth completion
use std::collections::BTreeMap;

use candle_core::{DType, Result, Tensor, D};

use crate::config::{CriterionConfig, LossKind};
use crate::data::DepthBatch;

/// Name of the optional smoothness term
pub const SMOOTH_TERM: &str = "smooth";

/// Loss of one batch
///
/// `loss` is what gets back-propagated; `terms` are auxiliary values reported
/// alongside it.
#[derive(Debug, Clone)]
pub struct LossResult {
    pub loss: Tensor,
    pub terms: BTreeMap<String, Tensor>,
}

impl LossResult {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            terms: BTreeMap::new(),
        }
    }

    pub fn with_term(mut self, name: &str, value: Tensor) -> Self {
        self.terms.insert(name.to_string(), value);
        self
    }

    pub fn term(&self, name: &str) -> Option<&Tensor> {
        self.terms.get(name)
    }

    /// Detached scalar value of `loss`
    pub fn loss_value(&self) -> Result<f64> {
        scalar(&self.loss)
    }

    /// Detached scalar value of a named term
    pub fn term_value(&self, name: &str) -> Result<Option<f64>> {
        self.terms.get(name).map(scalar).transpose()
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    t.detach().to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// Loss collaborator of the epoch loop
pub trait Criterion {
    /// Compute the loss of a batch whose `pred` has been attached
    fn compute(&self, batch: &DepthBatch) -> Result<LossResult>;

    /// Advance any epoch-staged behaviour; called once per epoch
    fn step(&mut self);
}

/// Masked regression loss with an optional, epoch-staged smoothness term
pub struct DepthCriterion {
    config: CriterionConfig,
    epoch: usize,
}

impl DepthCriterion {
    pub fn new(config: CriterionConfig) -> Self {
        Self { config, epoch: 0 }
    }

    /// Number of `step()` calls so far
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Whether the smoothness term is part of the loss at the current epoch
    pub fn smooth_active(&self) -> bool {
        self.config.smooth_weight > 0.0 && self.epoch >= self.config.smooth_start_epoch
    }

    fn regression_loss(&self, pred: &Tensor, gt: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let diff = (pred - gt)?;
        match self.config.kind {
            LossKind::Mse => diff.sqr()?.mean_all(),
            LossKind::L1 => diff.abs()?.mean_all(),
            LossKind::MaskedMse => masked_mean(&diff.sqr()?, mask, self.config.epsilon),
            LossKind::MaskedL1 => masked_mean(&diff.abs()?, mask, self.config.epsilon),
        }
    }
}

fn masked_mean(values: &Tensor, mask: &Tensor, epsilon: f64) -> Result<Tensor> {
    let total = (values * mask)?.sum_all()?;
    let count = mask.sum_all()?.affine(1.0, epsilon)?;
    total / count
}

/// Mean absolute first-order difference of `pred` along its last two axes,
/// relative to the mean depth range of the batch
pub fn smoothness(pred: &Tensor, depth_min: &Tensor, depth_max: &Tensor) -> Result<Tensor> {
    let h = pred.dim(D::Minus2)?;
    let w = pred.dim(D::Minus1)?;

    let mut total = Tensor::zeros((), pred.dtype(), pred.device())?;
    if w > 1 {
        let dx = (pred.narrow(D::Minus1, 1, w - 1)? - pred.narrow(D::Minus1, 0, w - 1)?)?;
        total = (total + dx.abs()?.mean_all()?)?;
    }
    if h > 1 {
        let dy = (pred.narrow(D::Minus2, 1, h - 1)? - pred.narrow(D::Minus2, 0, h - 1)?)?;
        total = (total + dy.abs()?.mean_all()?)?;
    }

    let range = (depth_max - depth_min)?.to_dtype(pred.dtype())?.mean_all()?;
    total / range
}

impl Criterion for DepthCriterion {
    fn compute(&self, batch: &DepthBatch) -> Result<LossResult> {
        let pred = batch.prediction()?;
        let gt = batch.depth_gt.to_dtype(pred.dtype())?;
        let mask = batch.depth_gt_mask.to_dtype(pred.dtype())?;

        let mut loss = self.regression_loss(pred, &gt, &mask)?;

        if self.config.smooth_weight <= 0.0 {
            return Ok(LossResult::new(loss));
        }

        let smooth = smoothness(pred, &batch.depth_min, &batch.depth_max)?;
        if self.smooth_active() {
            loss = (loss + (&smooth * self.config.smooth_weight)?)?;
        }
        Ok(LossResult::new(loss).with_term(SMOOTH_TERM, smooth.detach()))
    }

    fn step(&mut self) {
        self.epoch += 1;
        if self.config.smooth_weight > 0.0 && self.epoch == self.config.smooth_start_epoch {
            log::info!("Smoothness term enabled from epoch {}", self.epoch + 1);
        }
    }
}
