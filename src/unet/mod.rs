pub mod blocks;
pub mod mid_block;
pub mod unet_2d;

pub use unet_2d::{UNet2DModel, UNet2DModelConfig};
