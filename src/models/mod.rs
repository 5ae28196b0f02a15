/// Depth completion models
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{conv2d, ops, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::{Cbam, ConvBlock};

pub mod loader;

/// Execution mode passed explicitly into every forward computation
///
/// `Train` uses batch statistics and keeps the autograd graph; `Eval` uses
/// running statistics and returns a detached prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Train,
    Eval,
}

impl ExecutionMode {
    pub fn is_train(&self) -> bool {
        matches!(self, ExecutionMode::Train)
    }
}

/// A network mapping (rgb, depth) to a normalized depth prediction
pub trait DepthModel {
    /// # Arguments
    /// * `rgb` - [batch, 3, height, width]
    /// * `depth` - [batch, height, width] or [batch, 1, height, width], normalized to [0, 1]
    /// * `mode` - Train or Eval
    ///
    /// # Returns
    /// Raw prediction [batch, height, width] in [0, 1]
    fn forward_t(&self, rgb: &Tensor, depth: &Tensor, mode: ExecutionMode) -> Result<Tensor>;
}

impl<M: DepthModel + ?Sized> DepthModel for Box<M> {
    fn forward_t(&self, rgb: &Tensor, depth: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        (**self).forward_t(rgb, depth, mode)
    }
}

/// One encoder stage: stride-2 downsampling followed by CBAM
struct EncoderStage {
    down: ConvBlock,
    attention: Cbam,
}

/// Encoder/decoder depth completion network with CBAM attention
///
/// - Stem: concat(rgb, depth) -> `base_channels`
/// - Encoder: `num_stages` stride-2 stages, doubling channels, each refined by CBAM
/// - Decoder: nearest upsampling to the matching skip, conv halving channels, additive skip
/// - Head: 1-channel conv + sigmoid
pub struct CbamDepthNet {
    stem: ConvBlock,
    encoder: Vec<EncoderStage>,
    decoder: Vec<ConvBlock>,
    head: Conv2d,
    config: ModelConfig,
}

impl CbamDepthNet {
    /// Create new CbamDepthNet
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        let base = config.base_channels;
        let stem = ConvBlock::new(4, base, 1, vb.pp("stem"))?;

        let mut encoder = Vec::with_capacity(config.num_stages);
        let mut decoder = Vec::with_capacity(config.num_stages);
        for i in 0..config.num_stages {
            let in_ch = base << i;
            let out_ch = base << (i + 1);
            let stage_vb = vb.pp(format!("encoder.{i}"));
            encoder.push(EncoderStage {
                down: ConvBlock::new(in_ch, out_ch, 2, stage_vb.pp("down"))?,
                attention: Cbam::new(out_ch, config.reduction, stage_vb.pp("cbam"))?,
            });
            decoder.push(ConvBlock::new(out_ch, in_ch, 1, vb.pp(format!("decoder.{i}")))?);
        }

        let head_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let head = conv2d(base, 1, 3, head_config, vb.pp("head"))?;

        log::debug!(
            "CbamDepthNet: base_channels={}, num_stages={}, reduction={}",
            config.base_channels,
            config.num_stages,
            config.reduction
        );

        Ok(Self {
            stem,
            encoder,
            decoder,
            head,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl DepthModel for CbamDepthNet {
    fn forward_t(&self, rgb: &Tensor, depth: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let train = mode.is_train();
        let depth = match depth.rank() {
            3 => depth.unsqueeze(1)?,
            4 => depth.clone(),
            r => candle_core::bail!("depth must be rank 3 or 4, got rank {r}"),
        };
        let depth = depth.to_dtype(rgb.dtype())?;

        let x = Tensor::cat(&[rgb, &depth], 1)?;
        let mut x = self.stem.forward_t(&x, train)?;

        let mut skips = Vec::with_capacity(self.encoder.len());
        for stage in &self.encoder {
            skips.push(x.clone());
            x = stage.down.forward_t(&x, train)?;
            x = stage.attention.forward(&x)?;
        }

        for (block, skip) in self.decoder.iter().zip(skips.iter()).rev() {
            let (_, _, h, w) = skip.dims4()?;
            x = x.upsample_nearest2d(h, w)?;
            x = (block.forward_t(&x, train)? + skip)?;
        }

        let out = ops::sigmoid(&x.apply(&self.head)?)?.squeeze(1)?;
        match mode {
            ExecutionMode::Train => Ok(out),
            ExecutionMode::Eval => Ok(out.detach()),
        }
    }
}

/// Data-parallel wrapper
///
/// Scatters each batch into up to `replicas` chunks along the batch axis, runs
/// the wrapped model on every chunk and gathers the results. Parameters stay
/// those of the wrapped model; `module()` and `into_inner()` unwrap it.
///
/// Chunks run one after another on the device of the input, the primary
/// device. Nothing is replicated or placed on other devices, so `replicas`
/// only sets how the batch is split.
pub struct DataParallel<M> {
    module: M,
    replicas: usize,
}

impl<M: DepthModel> DataParallel<M> {
    pub fn new(module: M, replicas: usize) -> Self {
        Self {
            module,
            replicas: replicas.max(1),
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

impl<M: DepthModel> DepthModel for DataParallel<M> {
    fn forward_t(&self, rgb: &Tensor, depth: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let rgb_chunks = rgb.chunk(self.replicas, 0)?;
        let depth_chunks = depth.chunk(self.replicas, 0)?;
        let outputs = rgb_chunks
            .iter()
            .zip(depth_chunks.iter())
            .map(|(r, d)| self.module.forward_t(r, d, mode))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&outputs, 0)
    }
}
