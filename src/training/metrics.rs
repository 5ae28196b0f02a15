/// Depth evaluation metrics
use std::collections::BTreeMap;

use candle_core::{DType, Result};

use crate::config::{MetricKind, MetricsConfig};
use crate::data::DepthBatch;

/// Metric name -> value
pub type MetricsResult = BTreeMap<String, f64>;

/// Log a metrics result, one line per metric
pub fn display_results(results: &MetricsResult) {
    if results.is_empty() {
        log::info!("No metrics recorded.");
        return;
    }
    log::info!("Metrics results:");
    for (name, value) in results {
        log::info!("  {}: {:.6}", name, value);
    }
}

/// Metrics collaborator of the eval pass
pub trait Metrics {
    /// Drop everything recorded so far
    fn clear(&mut self);

    /// Evaluate one batch (with `pred` attached); when `record` is set the
    /// batch also counts towards `get_results`
    fn evaluate_batch(&mut self, batch: &DepthBatch, record: bool) -> Result<MetricsResult>;

    /// Means over every recorded sample
    fn get_results(&self) -> MetricsResult;

    fn display_results(&self) {
        display_results(&self.get_results());
    }
}

/// Per-sample error statistics over the masked pixels
#[derive(Debug, Clone, Copy, Default)]
struct SampleErrors {
    mse: f64,
    mae: f64,
    rel: f64,
    delta105: f64,
    delta110: f64,
    delta125: f64,
}

impl SampleErrors {
    fn get(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Mse => self.mse,
            MetricKind::Rmse => self.mse.sqrt(),
            MetricKind::Rel => self.rel,
            MetricKind::Mae => self.mae,
            MetricKind::Delta105 => self.delta105,
            MetricKind::Delta110 => self.delta110,
            MetricKind::Delta125 => self.delta125,
        }
    }
}

fn sample_errors(pred: &[f32], gt: &[f32], mask: &[f32], epsilon: f64) -> Option<SampleErrors> {
    let mut errors = SampleErrors::default();
    let mut count = 0usize;

    for ((&p, &g), &m) in pred.iter().zip(gt.iter()).zip(mask.iter()) {
        if m <= 0.0 {
            continue;
        }
        let (p, g) = (p as f64, g as f64);
        let diff = p - g;
        let ratio = (p.max(epsilon) / g.max(epsilon)).max(g.max(epsilon) / p.max(epsilon));

        errors.mse += diff * diff;
        errors.mae += diff.abs();
        errors.rel += diff.abs() / g.max(epsilon);
        errors.delta105 += (ratio < 1.05) as u8 as f64;
        errors.delta110 += (ratio < 1.10) as u8 as f64;
        errors.delta125 += (ratio < 1.25) as u8 as f64;
        count += 1;
    }

    if count == 0 {
        return None;
    }
    let n = count as f64;
    Some(SampleErrors {
        mse: errors.mse / n,
        mae: errors.mae / n,
        rel: errors.rel / n,
        delta105: errors.delta105 / n,
        delta110: errors.delta110 / n,
        delta125: errors.delta125 / n,
    })
}

/// Standard depth completion metrics, averaged per sample
///
/// Samples without any valid ground-truth pixel are skipped.
pub struct DepthMetrics {
    kinds: Vec<MetricKind>,
    epsilon: f64,
    sums: BTreeMap<MetricKind, f64>,
    num_samples: usize,
}

impl DepthMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            kinds: config.types,
            epsilon: config.epsilon,
            sums: BTreeMap::new(),
            num_samples: 0,
        }
    }

    /// Number of recorded samples
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn to_result(&self, sums: &BTreeMap<MetricKind, f64>, count: usize) -> MetricsResult {
        if count == 0 {
            return MetricsResult::new();
        }
        self.kinds
            .iter()
            .map(|k| {
                let sum = sums.get(k).copied().unwrap_or(0.0);
                (k.name().to_string(), sum / count as f64)
            })
            .collect()
    }
}

impl Metrics for DepthMetrics {
    fn clear(&mut self) {
        self.sums.clear();
        self.num_samples = 0;
    }

    fn evaluate_batch(&mut self, batch: &DepthBatch, record: bool) -> Result<MetricsResult> {
        let pred = batch.prediction()?.detach().to_dtype(DType::F32)?.flatten_from(1)?.to_vec2::<f32>()?;
        let gt = batch.depth_gt.to_dtype(DType::F32)?.flatten_from(1)?.to_vec2::<f32>()?;
        let mask = batch.depth_gt_mask.to_dtype(DType::F32)?.flatten_from(1)?.to_vec2::<f32>()?;

        let mut batch_sums = BTreeMap::new();
        let mut batch_count = 0usize;
        for ((p, g), m) in pred.iter().zip(gt.iter()).zip(mask.iter()) {
            let Some(errors) = sample_errors(p, g, m, self.epsilon) else {
                continue;
            };
            for &kind in &self.kinds {
                *batch_sums.entry(kind).or_insert(0.0) += errors.get(kind);
            }
            batch_count += 1;
        }

        if record {
            for (kind, sum) in &batch_sums {
                *self.sums.entry(*kind).or_insert(0.0) += sum;
            }
            self.num_samples += batch_count;
        }

        Ok(self.to_result(&batch_sums, batch_count))
    }

    fn get_results(&self) -> MetricsResult {
        self.to_result(&self.sums, self.num_samples)
    }
}
