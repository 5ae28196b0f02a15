/// Data loading modules for depth completion training
pub mod numpy_dataset;

pub use numpy_dataset::{DatasetMetadata, DepthDataLoader, DepthDataset};

use candle_core::{Device, Result, Tensor};

/// One batch of depth completion samples
///
/// `pred` is empty when the loader yields the batch and is filled exactly once
/// by the epoch loop, before the criterion runs.
#[derive(Debug, Clone)]
pub struct DepthBatch {
    /// [batch, 3, height, width], values in [0, 1]
    pub rgb: Tensor,
    /// [batch, height, width], normalized to [0, 1]
    pub depth: Tensor,
    /// [batch, height, width], metres
    pub depth_gt: Tensor,
    /// [batch, height, width], 1.0 where `depth_gt` is valid
    pub depth_gt_mask: Tensor,
    /// [batch]
    pub depth_min: Tensor,
    /// [batch]
    pub depth_max: Tensor,
    /// [batch, height, width], metres
    pub pred: Option<Tensor>,
}

impl DepthBatch {
    pub fn batch_size(&self) -> Result<usize> {
        self.rgb.dim(0)
    }

    /// Move every tensor of the batch to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            rgb: self.rgb.to_device(device)?,
            depth: self.depth.to_device(device)?,
            depth_gt: self.depth_gt.to_device(device)?,
            depth_gt_mask: self.depth_gt_mask.to_device(device)?,
            depth_min: self.depth_min.to_device(device)?,
            depth_max: self.depth_max.to_device(device)?,
            pred: match &self.pred {
                Some(p) => Some(p.to_device(device)?),
                None => None,
            },
        })
    }

    /// Denormalize a raw model output and store it as `pred`
    pub fn attach_prediction(&mut self, raw: &Tensor) -> Result<()> {
        if self.pred.is_some() {
            candle_core::bail!("prediction already attached to this batch");
        }
        self.pred = Some(denormalize(raw, &self.depth_min, &self.depth_max)?);
        Ok(())
    }

    /// The attached prediction, or an error if the model has not run yet
    pub fn prediction(&self) -> Result<&Tensor> {
        match &self.pred {
            Some(p) => Ok(p),
            None => candle_core::bail!("batch has no prediction attached"),
        }
    }
}

/// Map a [0, 1] model output back to the per-sample depth range
///
/// `raw * (depth_max - depth_min) + depth_min`, with the per-sample scalars
/// reshaped to [batch, 1, ..., 1] so they broadcast over every other axis.
///
/// Evaluated as `raw * depth_max + (1 - raw) * depth_min` so that 0 and 1 map
/// to exactly `depth_min` and `depth_max` in floating point.
pub fn denormalize(raw: &Tensor, depth_min: &Tensor, depth_max: &Tensor) -> Result<Tensor> {
    let batch = raw.dim(0)?;
    let mut shape = vec![1usize; raw.rank()];
    shape[0] = batch;

    let depth_min = depth_min.to_dtype(raw.dtype())?.reshape(shape.as_slice())?;
    let depth_max = depth_max.to_dtype(raw.dtype())?.reshape(shape.as_slice())?;
    let complement = raw.affine(-1.0, 1.0)?;

    raw.broadcast_mul(&depth_max)? + complement.broadcast_mul(&depth_min)?
}

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch, on whatever device the loader builds it on
    fn next_batch(&mut self) -> Result<Option<DepthBatch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn batch_of(depth_min: &[f32], depth_max: &[f32], h: usize, w: usize) -> Result<DepthBatch> {
        let device = Device::Cpu;
        let b = depth_min.len();
        Ok(DepthBatch {
            rgb: Tensor::zeros((b, 3, h, w), DType::F32, &device)?,
            depth: Tensor::zeros((b, h, w), DType::F32, &device)?,
            depth_gt: Tensor::zeros((b, h, w), DType::F32, &device)?,
            depth_gt_mask: Tensor::ones((b, h, w), DType::F32, &device)?,
            depth_min: Tensor::new(depth_min, &device)?,
            depth_max: Tensor::new(depth_max, &device)?,
            pred: None,
        })
    }

    #[test]
    fn test_denormalize_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let d0 = Tensor::new(&[0.3f32, 1.0], &device)?;
        let d1 = Tensor::new(&[1.5f32, 4.0], &device)?;

        let zeros = Tensor::zeros((2, 3, 3), DType::F32, &device)?;
        let ones = Tensor::ones((2, 3, 3), DType::F32, &device)?;

        let lo = denormalize(&zeros, &d0, &d1)?.to_vec3::<f32>()?;
        let hi = denormalize(&ones, &d0, &d1)?.to_vec3::<f32>()?;

        for (b, (min, max)) in [(0.3f32, 1.5f32), (1.0, 4.0)].iter().enumerate() {
            assert!(lo[b].iter().flatten().all(|v| v == min));
            assert!(hi[b].iter().flatten().all(|v| v == max));
        }

        Ok(())
    }

    #[test]
    fn test_denormalize_affine() -> Result<()> {
        let device = Device::Cpu;
        let d0 = Tensor::new(&[2.0f32], &device)?;
        let d1 = Tensor::new(&[6.0f32], &device)?;
        let raw = Tensor::new(&[[[0.25f32, 0.5], [0.75, 0.1]]], &device)?;

        let out = denormalize(&raw, &d0, &d1)?.to_vec3::<f32>()?;
        let expected = [[3.0f32, 4.0], [5.0, 2.4]];
        for (row, exp_row) in out[0].iter().zip(expected.iter()) {
            for (v, e) in row.iter().zip(exp_row.iter()) {
                assert!((v - e).abs() < 1e-6);
            }
        }

        Ok(())
    }

    #[test]
    fn test_denormalize_rank4_scenario() -> Result<()> {
        // batch 2, single-channel [2, 1, 4, 4], range [0, 10], raw 0.5 -> 5.0
        let device = Device::Cpu;
        let raw = Tensor::full(0.5f32, (2, 1, 4, 4), &device)?;
        let d0 = Tensor::new(&[0.0f32, 0.0], &device)?;
        let d1 = Tensor::new(&[10.0f32, 10.0], &device)?;

        let out = denormalize(&raw, &d0, &d1)?;
        assert_eq!(out.dims(), &[2, 1, 4, 4]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v == 5.0));

        Ok(())
    }

    #[test]
    fn test_attach_prediction_once() -> Result<()> {
        let mut batch = batch_of(&[0.0, 1.0], &[2.0, 3.0], 2, 2)?;
        assert!(batch.prediction().is_err());

        let raw = Tensor::full(0.5f32, (2, 2, 2), &Device::Cpu)?;
        batch.attach_prediction(&raw)?;

        let pred = batch.prediction()?.to_vec3::<f32>()?;
        assert!(pred[0].iter().flatten().all(|v| *v == 1.0));
        assert!(pred[1].iter().flatten().all(|v| *v == 2.0));

        assert!(batch.attach_prediction(&raw).is_err());
        Ok(())
    }

    #[test]
    fn test_to_device_keeps_shapes() -> Result<()> {
        let batch = batch_of(&[0.0], &[1.0], 3, 5)?;
        let moved = batch.to_device(&Device::Cpu)?;
        assert_eq!(moved.rgb.dims(), &[1, 3, 3, 5]);
        assert_eq!(moved.depth_min.dims(), &[1]);
        assert!(moved.pred.is_none());
        assert_eq!(moved.batch_size()?, 1);
        Ok(())
    }
}
