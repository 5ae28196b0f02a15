/// Convolutional block attention (CBAM)
///
/// Channel attention followed by spatial attention, each producing a sigmoid
/// gate that reweights the feature map it was computed from.
use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, ops, Conv2d, Conv2dConfig, VarBuilder};

use super::bottleneck::Bottleneck;

/// Kernel size of the spatial attention convolution
const SPATIAL_KERNEL: usize = 7;

/// Width of the channel attention bottleneck for `channels` and ratio `reduction`
pub fn reduced_width(channels: usize, reduction: f64) -> usize {
    ((channels as f64 * reduction).round() as usize).max(1)
}

/// Channel attention
///
/// Global max- and average-pooled channel statistics each pass through their
/// own bottleneck; the summed outputs go through a sigmoid to give one gate
/// value per (batch, channel).
pub struct ChannelAttention {
    max_branch: Bottleneck,
    avg_branch: Bottleneck,
    channels: usize,
}

impl ChannelAttention {
    /// Create new ChannelAttention
    ///
    /// # Arguments
    /// * `channels` - Number of input channels C
    /// * `reduction` - Bottleneck ratio r in (0, 1]; hidden width is round(C * r)
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(channels: usize, reduction: f64, vb: VarBuilder) -> Result<Self> {
        if !(reduction > 0.0 && reduction <= 1.0) {
            candle_core::bail!("channel attention reduction must be in (0, 1], got {reduction}");
        }
        let hidden = reduced_width(channels, reduction);
        let max_branch = Bottleneck::new(channels, hidden, channels, vb.pp("max_branch"))?;
        let avg_branch = Bottleneck::new(channels, hidden, channels, vb.pp("avg_branch"))?;

        Ok(Self {
            max_branch,
            avg_branch,
            channels,
        })
    }

    /// Channel gate, shape [batch, channels, 1, 1], values in (0, 1)
    pub fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, channels, _h, _w) = xs.dims4()?;
        if channels != self.channels {
            candle_core::bail!(
                "channel attention built for {} channels, got {}",
                self.channels,
                channels
            );
        }

        // [B, C, H*W] -> [B, C]
        let flat = xs.flatten_from(2)?;
        let max_pooled = flat.max(2)?;
        let avg_pooled = flat.mean(2)?;

        let weight = (self.max_branch.forward(&max_pooled)? + self.avg_branch.forward(&avg_pooled)?)?;
        ops::sigmoid(&weight)?.reshape((batch, channels, 1, 1))
    }
}

impl Module for ChannelAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate(xs)?;
        xs.broadcast_mul(&gate)
    }
}

/// Spatial attention
///
/// Per-pixel max and mean across channels are stacked into a 2-channel map and
/// convolved (7x7, padding 3) down to a single sigmoid gate per pixel.
pub struct SpatialAttention {
    conv: Conv2d,
}

impl SpatialAttention {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: SPATIAL_KERNEL / 2,
            stride: 1,
            ..Default::default()
        };
        let conv = conv2d(2, 1, SPATIAL_KERNEL, config, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    /// Spatial gate, shape [batch, 1, height, width], values in (0, 1)
    pub fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        let max_map = xs.max_keepdim(1)?;
        let mean_map = xs.mean_keepdim(1)?;
        let stacked = Tensor::cat(&[&max_map, &mean_map], 1)?;
        ops::sigmoid(&stacked.apply(&self.conv)?)
    }
}

impl Module for SpatialAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate(xs)?;
        xs.broadcast_mul(&gate)
    }
}

/// CBAM block: channel attention, then spatial attention on its output
///
/// The order is fixed; swapping the two stages gives a different transform.
pub struct Cbam {
    channel: ChannelAttention,
    spatial: SpatialAttention,
}

impl Cbam {
    pub fn new(channels: usize, reduction: f64, vb: VarBuilder) -> Result<Self> {
        let channel = ChannelAttention::new(channels, reduction, vb.pp("channel"))?;
        let spatial = SpatialAttention::new(vb.pp("spatial"))?;
        Ok(Self { channel, spatial })
    }

    pub fn channel_attention(&self) -> &ChannelAttention {
        &self.channel
    }

    pub fn spatial_attention(&self) -> &SpatialAttention {
        &self.spatial
    }
}

impl Module for Cbam {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.channel)?.apply(&self.spatial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn assert_open_unit(t: &Tensor) -> Result<()> {
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        for v in values {
            assert!(v > 0.0 && v < 1.0, "gate value {} outside (0, 1)", v);
        }
        Ok(())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_reduced_width() {
        assert_eq!(reduced_width(64, 0.5), 32);
        assert_eq!(reduced_width(3, 0.5), 2);
        assert_eq!(reduced_width(2, 0.1), 1);
        assert_eq!(reduced_width(8, 1.0), 8);
    }

    #[test]
    fn test_channel_attention_shape_and_gate() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ca = ChannelAttention::new(8, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 5, 6), &device)?;

        let gate = ca.gate(&x)?;
        assert_eq!(gate.dims(), &[2, 8, 1, 1]);
        assert_open_unit(&gate)?;

        let out = ca.forward(&x)?;
        assert_eq!(out.dims(), x.dims());

        Ok(())
    }

    #[test]
    fn test_channel_attention_matches_manual_gating() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ca = ChannelAttention::new(4, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3, 3), &device)?;

        let gate = ca.gate(&x)?;
        let out = ca.forward(&x)?;

        // Each channel is scaled by exactly its own gate value
        let gate_vals = gate.flatten_all()?.to_vec1::<f32>()?;
        for (c, g) in gate_vals.iter().enumerate() {
            let expected = (x.get(0)?.get(c)? * (*g as f64))?;
            let actual = out.get(0)?.get(c)?;
            assert!(max_abs_diff(&expected, &actual)? < 1e-6);
        }

        Ok(())
    }

    #[test]
    fn test_channel_attention_rejects_bad_reduction() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        assert!(ChannelAttention::new(8, 0.0, vb.clone()).is_err());
        assert!(ChannelAttention::new(8, 1.5, vb.clone()).is_err());
        assert!(ChannelAttention::new(8, f64::NAN, vb).is_err());
    }

    #[test]
    fn test_channel_attention_rejects_wrong_channels() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ca = ChannelAttention::new(8, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3, 3), &device)?;
        assert!(ca.forward(&x).is_err());

        Ok(())
    }

    #[test]
    fn test_spatial_attention_shape_and_gate() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let sa = SpatialAttention::new(vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 6, 9, 7), &device)?;

        let gate = sa.gate(&x)?;
        assert_eq!(gate.dims(), &[2, 1, 9, 7]);
        assert_open_unit(&gate)?;

        let out = sa.forward(&x)?;
        assert_eq!(out.dims(), x.dims());

        Ok(())
    }

    #[test]
    fn test_cbam_is_channel_then_spatial() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cbam = Cbam::new(8, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 6, 6), &device)?;

        let out = cbam.forward(&x)?;
        assert_eq!(out.dims(), x.dims());

        let sequential = cbam
            .spatial_attention()
            .forward(&cbam.channel_attention().forward(&x)?)?;
        assert_eq!(max_abs_diff(&out, &sequential)?, 0.0);

        let reversed = cbam
            .channel_attention()
            .forward(&cbam.spatial_attention().forward(&x)?)?;
        assert!(max_abs_diff(&out, &reversed)? > 1e-6);

        Ok(())
    }
}
