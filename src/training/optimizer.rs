/// Optimizer selection over candle-nn's AdamW and SGD
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::{OptimizerConfig, OptimizerKind};

/// The optimizer driving the train pass
///
/// Binds to the variables it is created with; those are the only tensors it
/// ever mutates.
pub enum DepthOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl DepthOptimizer {
    /// Create new optimizer
    ///
    /// # Arguments
    /// * `vars` - Parameters to optimize
    /// * `config` - Optimizer configuration
    /// * `lr` - Initial learning rate (config rate, or the resume rate)
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig, lr: f64) -> Result<Self> {
        match config.kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.eps,
                    weight_decay: config.weight_decay,
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => Ok(Self::Sgd(SGD::new(vars, lr)?)),
        }
    }

    /// Compute fresh gradients of `loss` and apply one update
    ///
    /// Gradients are never accumulated across calls.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        }
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
