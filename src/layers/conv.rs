/// Convolution + batch normalization + ReLU
use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

/// 3x3 convolution block used throughout the backbone
///
/// The convolution has no bias since batch normalization follows it.
/// In training mode batch statistics are used and the running statistics are
/// updated; in eval mode the running statistics are used.
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBlock {
    /// Create new ConvBlock
    ///
    /// # Arguments
    /// * `in_channels` - Input channels
    /// * `out_channels` - Output channels
    /// * `stride` - 1 keeps the spatial size, 2 halves it (rounding up)
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_channels, out_channels, 3, config, vb.pp("conv"))?;
        let bn = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, train)?.relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_conv_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let same = ConvBlock::new(4, 8, 1, vb.pp("same"))?;
        let down = ConvBlock::new(4, 8, 2, vb.pp("down"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 9, 8), &device)?;

        assert_eq!(same.forward_t(&x, true)?.dims(), &[2, 8, 9, 8]);
        assert_eq!(down.forward_t(&x, false)?.dims(), &[2, 8, 5, 4]);

        Ok(())
    }

    #[test]
    fn test_conv_block_is_non_negative() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = ConvBlock::new(3, 4, 1, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let min = block
            .forward_t(&x, false)?
            .flatten_all()?
            .min(0)?
            .to_scalar::<f32>()?;
        assert!(min >= 0.0);

        Ok(())
    }
}
