/// Weight loading from safetensors files
use std::path::Path;
use candle_core::{Device, DType};
use candle_nn::VarBuilder;
use crate::config::ModelConfig;
use super::CbamDepthNet;

/// Load model from safetensors file
///
/// Checkpoint files (`checkpoint.tar`, `checkpoint-epoch{N}.tar`) are
/// safetensors payloads and can be passed here directly for inference.
///
/// # Arguments
/// * `config` - Model configuration
/// * `weights_path` - Path to safetensors file
/// * `device` - Device to load model on
///
/// # Returns
/// Loaded CbamDepthNet
pub fn load_model<P: AsRef<Path>>(
    config: ModelConfig,
    weights_path: P,
    device: &Device,
) -> crate::Result<CbamDepthNet> {
    // Load weights using Candle's built-in safetensors support
    let dtype = DType::F32;
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(
            &[weights_path.as_ref()],
            dtype,
            device,
        )?
    };

    Ok(CbamDepthNet::new(config, vb)?)
}
