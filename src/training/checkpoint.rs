/// Model checkpointing with safetensors
///
/// A checkpoint holds the model's named tensors plus a JSON metadata record
/// (`epoch`, `loss`, `metrics`) stored in the safetensors header. Each stats
/// directory keeps one best file and one rolling file per epoch.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::SafeTensors;

use crate::training::metrics::MetricsResult;
use crate::DepthError;

/// File name of the best checkpoint
pub const BEST_CHECKPOINT: &str = "checkpoint.tar";

/// Header metadata key holding the JSON record
const METADATA_KEY: &str = "checkpoint";

/// File name of the rolling checkpoint written after `epoch`
pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("checkpoint-epoch{}.tar", epoch)
}

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Number of completed epochs
    pub epoch: usize,
    /// Test loss of the last completed epoch
    pub loss: f64,
    /// Test metrics of the last completed epoch
    #[serde(default)]
    pub metrics: MetricsResult,
}

/// Model checkpoint
pub struct Checkpoint {
    /// Model parameters
    pub tensors: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Snapshot every variable of `varmap`
    pub fn from_varmap(varmap: &VarMap, metadata: CheckpointMetadata) -> crate::Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| DepthError::Checkpoint(format!("VarMap lock poisoned: {}", e)))?;
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();
        Ok(Self::new(tensors, metadata))
    }

    /// Save checkpoint to file
    ///
    /// The payload is written to a sibling temp file and renamed over `path`,
    /// so an interrupted save never leaves a truncated file behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let header = serde_json::to_string(&self.metadata)?;
        let info = Some(HashMap::from([(METADATA_KEY.to_string(), header)]));

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        safetensors::tensor::serialize_to_file(self.tensors.iter(), &info, &tmp)?;
        std::fs::rename(&tmp, path)?;

        log::debug!("Saved checkpoint {} (epoch {})", path.display(), self.metadata.epoch);
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data)?;
        let record = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| {
                DepthError::Checkpoint(format!("{} has no checkpoint metadata", path.display()))
            })?;
        let metadata: CheckpointMetadata = serde_json::from_str(record)?;

        let tensors = candle_core::safetensors::load_buffer(&data, device)?;
        Ok(Self { tensors, metadata })
    }

    /// Copy the stored tensors into the matching variables of `varmap`
    ///
    /// Every variable must have a stored tensor of the same shape.
    pub fn restore_into(&self, varmap: &VarMap) -> crate::Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| DepthError::Checkpoint(format!("VarMap lock poisoned: {}", e)))?;
        for (name, var) in data.iter() {
            let tensor = self.tensors.get(name).ok_or_else(|| {
                DepthError::Checkpoint(format!("checkpoint is missing tensor '{}'", name))
            })?;
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }
}

/// Owns the checkpoint files of one stats directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    stats_dir: PathBuf,
}

impl CheckpointManager {
    /// Use `stats_dir`, creating it when missing
    pub fn new<P: AsRef<Path>>(stats_dir: P) -> crate::Result<Self> {
        let stats_dir = stats_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&stats_dir)?;
        Ok(Self { stats_dir })
    }

    pub fn stats_dir(&self) -> &Path {
        &self.stats_dir
    }

    pub fn best_path(&self) -> PathBuf {
        self.stats_dir.join(BEST_CHECKPOINT)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.stats_dir.join(epoch_checkpoint_name(epoch))
    }

    /// Load the best checkpoint if one exists
    pub fn load_best(&self, device: &Device) -> crate::Result<Option<Checkpoint>> {
        let path = self.best_path();
        if !path.exists() {
            return Ok(None);
        }
        log::info!("Loading checkpoint from {}", path.display());
        Checkpoint::load(&path, device).map(Some)
    }

    /// Write the rolling checkpoint of `epoch`
    pub fn save_epoch(&self, epoch: usize, checkpoint: &Checkpoint) -> crate::Result<PathBuf> {
        let path = self.epoch_path(epoch);
        checkpoint.save(&path)?;
        Ok(path)
    }

    /// Overwrite the best checkpoint
    pub fn save_best(&self, checkpoint: &Checkpoint) -> crate::Result<PathBuf> {
        let path = self.best_path();
        checkpoint.save(&path)?;
        Ok(path)
    }
}
