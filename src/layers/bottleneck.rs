/// Two-layer reduction MLP
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Compress-then-expand transform: `fc2(relu(fc1(x)))`
///
/// There is no activation after the second layer; callers apply their own
/// gating on the output.
pub struct Bottleneck {
    fc1: Linear,
    fc2: Linear,
    hidden: usize,
}

impl Bottleneck {
    /// Create new Bottleneck
    ///
    /// # Arguments
    /// * `in_features` - Input width
    /// * `hidden` - Compressed width
    /// * `out_features` - Output width
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_features: usize, hidden: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        if hidden == 0 {
            candle_core::bail!("bottleneck hidden width must be > 0");
        }
        let fc1 = linear(in_features, hidden, vb.pp("fc1"))?;
        let fc2 = linear(hidden, out_features, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2, hidden })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.relu()?.apply(&self.fc2)
    }
}
