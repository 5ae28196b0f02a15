/// NumPy dataset loader for depth completion data (.npy format)
use candle_core::{Device, Result, Tensor};
use ndarray::{s, Array1, Array3, Array4, Axis};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{BatchDataLoader, DepthBatch};

/// Metadata from dataset.json
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub num_examples: usize,
    #[serde(default)]
    pub description: String,
}

/// Depth completion samples held in memory
///
/// Raw and ground-truth depth are clipped to `[depth_min, depth_max]`; the
/// input depth is additionally normalized to [0, 1] over that range.
pub struct DepthDataset {
    rgb: Array4<f32>,      // [N, 3, H, W]
    depth: Array3<f32>,    // [N, H, W], normalized
    depth_gt: Array3<f32>, // [N, H, W], metres
    mask: Array3<f32>,     // [N, H, W], 0/1
    depth_min: f32,
    depth_max: f32,
    metadata: DatasetMetadata,
}

fn read_npy<A: ReadNpyExt>(path: &Path) -> crate::Result<A> {
    A::read_npy(File::open(path)?).map_err(|e| {
        crate::DepthError::Data(format!("Failed to read {}: {}", path.display(), e))
    })
}

impl DepthDataset {
    /// Load from a split directory holding `rgb.npy`, `depth.npy`,
    /// `depth_gt.npy`, and optionally `depth_gt_mask.npy` and `dataset.json`
    pub fn from_directory<P: AsRef<Path>>(path: P, depth_min: f32, depth_max: f32) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading depth dataset from: {:?}", dir);

        // Load metadata
        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let file = File::open(&metadata_path)?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)?
        } else {
            log::warn!("dataset.json not found, using defaults");
            DatasetMetadata::default()
        };

        let rgb: Array4<f32> = read_npy(&dir.join("rgb.npy"))?;
        let depth: Array3<f32> = read_npy(&dir.join("depth.npy"))?;
        let depth_gt: Array3<f32> = read_npy(&dir.join("depth_gt.npy"))?;

        let mask_path = dir.join("depth_gt_mask.npy");
        let mask: Option<Array3<f32>> = if mask_path.exists() {
            Some(read_npy(&mask_path)?)
        } else {
            log::warn!("depth_gt_mask.npy not found, masking on depth_gt > 0");
            None
        };

        log::info!("Loaded rgb: shape {:?}", rgb.shape());
        log::info!("Loaded depth: shape {:?}", depth.shape());

        Self::from_arrays(rgb, depth, depth_gt, mask, depth_min, depth_max, metadata)
    }

    /// Build from in-memory arrays
    ///
    /// # Arguments
    /// * `rgb` - [N, 3, H, W]
    /// * `depth` - [N, H, W] raw depth in metres, 0 where missing
    /// * `depth_gt` - [N, H, W] ground truth in metres, 0 where missing
    /// * `mask` - optional [N, H, W] validity mask, AND-ed with `depth_gt > 0`
    pub fn from_arrays(
        rgb: Array4<f32>,
        depth: Array3<f32>,
        depth_gt: Array3<f32>,
        mask: Option<Array3<f32>>,
        depth_min: f32,
        depth_max: f32,
        metadata: DatasetMetadata,
    ) -> crate::Result<Self> {
        let (n, c, h, w) = rgb.dim();
        if c != 3 {
            return Err(crate::DepthError::Data(format!(
                "rgb must have 3 channels, got {}",
                c
            )));
        }
        if depth.dim() != (n, h, w) || depth_gt.dim() != (n, h, w) {
            return Err(crate::DepthError::Data(format!(
                "Shape mismatch: rgb {:?}, depth {:?}, depth_gt {:?}",
                rgb.shape(),
                depth.shape(),
                depth_gt.shape()
            )));
        }
        if let Some(m) = &mask {
            if m.dim() != (n, h, w) {
                return Err(crate::DepthError::Data(format!(
                    "Shape mismatch: depth_gt_mask {:?}, expected {:?}",
                    m.shape(),
                    (n, h, w)
                )));
            }
        }
        if !(depth_max > depth_min) {
            return Err(crate::DepthError::Data(format!(
                "Invalid depth range [{}, {}]",
                depth_min, depth_max
            )));
        }

        let valid_gt = depth_gt.mapv(|d| if d > 0.0 { 1.0 } else { 0.0 });
        let mask = match mask {
            Some(m) => valid_gt * m.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            None => valid_gt,
        };

        let range = depth_max - depth_min;
        let depth = depth.mapv(|d| (d.clamp(depth_min, depth_max) - depth_min) / range);
        let depth_gt = depth_gt.mapv(|d| d.clamp(depth_min, depth_max));

        log::info!(
            "Dataset loaded: {} examples, {}x{}, depth range [{}, {}]",
            n,
            h,
            w,
            depth_min,
            depth_max
        );

        Ok(Self {
            rgb,
            depth,
            depth_gt,
            mask,
            depth_min,
            depth_max,
            metadata,
        })
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.rgb.len_of(Axis(0))
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (height, width) of every sample
    pub fn image_size(&self) -> (usize, usize) {
        let (_, _, h, w) = self.rgb.dim();
        (h, w)
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Gather `indices` into a batch on `device`
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<DepthBatch> {
        let b = indices.len();
        let (h, w) = self.image_size();

        let rgb = self.rgb.select(Axis(0), indices);
        let depth = self.depth.select(Axis(0), indices);
        let depth_gt = self.depth_gt.select(Axis(0), indices);
        let mask = self.mask.select(Axis(0), indices);

        let to_tensor3 = |a: Array3<f32>| Tensor::from_iter(a.into_iter(), device)?.reshape((b, h, w));

        Ok(DepthBatch {
            rgb: Tensor::from_iter(rgb.into_iter(), device)?.reshape((b, 3, h, w))?,
            depth: to_tensor3(depth)?,
            depth_gt: to_tensor3(depth_gt)?,
            depth_gt_mask: to_tensor3(mask)?,
            depth_min: Tensor::from_vec(vec![self.depth_min; b], b, device)?,
            depth_max: Tensor::from_vec(vec![self.depth_max; b], b, device)?,
            pred: None,
        })
    }

    /// Ground truth of one sample, for inspection
    pub fn depth_gt_row(&self, idx: usize) -> Array1<f32> {
        self.depth_gt.slice(s![idx, .., ..]).iter().copied().collect()
    }
}

/// Data loader for NumPy depth datasets
pub struct DepthDataLoader {
    dataset: DepthDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    device: Device,
}

impl DepthDataLoader {
    /// Create new data loader; batches are built on the CPU
    pub fn new(dataset: DepthDataset, batch_size: usize, shuffle: bool) -> Self {
        let num_samples = dataset.len();
        let mut indices: Vec<usize> = (0..num_samples).collect();

        if shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            indices.shuffle(&mut rng);
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_idx: 0,
            indices,
            shuffle,
            device: Device::Cpu,
        }
    }

    /// Get next batch
    pub fn next_batch(&mut self) -> Result<Option<DepthBatch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch = self
            .dataset
            .batch(&self.indices[self.current_idx..end_idx], &self.device)?;
        self.current_idx = end_idx;

        Ok(Some(batch))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &DepthDataset {
        &self.dataset
    }
}

// Implement BatchDataLoader trait
impl BatchDataLoader for DepthDataLoader {
    fn next_batch(&mut self) -> Result<Option<DepthBatch>> {
        DepthDataLoader::next_batch(self)
    }

    fn reset(&mut self) {
        DepthDataLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        DepthDataLoader::num_batches(self)
    }
}
