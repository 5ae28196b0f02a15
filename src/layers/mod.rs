/// Neural network layer primitives
///
/// This module contains the building blocks for the depth completion model:
/// - CBAM attention (channel, spatial, and their composition)
/// - Reduction bottleneck used by channel attention
/// - Convolution blocks with batch normalization

pub mod attention;
pub mod bottleneck;
pub mod conv;

pub use attention::{Cbam, ChannelAttention, SpatialAttention};
pub use bottleneck::Bottleneck;
pub use conv::ConvBlock;
