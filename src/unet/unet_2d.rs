//! 2D UNet Denoising Model
//!
//! Takes a noisy sample and the current diffusion timestep, returns an
//! estimate of the noise component. This is the unconditional variant:
//! there is no text or class conditioning, only the timestep embedding.
use candle_core::{bail, DType, Module, Result, Tensor};
use candle_nn as nn;
use serde::Deserialize;

use super::blocks::{
    AttnDownBlock2D, AttnDownBlock2DConfig, AttnUpBlock2D, AttnUpBlock2DConfig, DownBlock2D,
    DownBlock2DConfig, UpBlock2D, UpBlock2DConfig,
};
use super::mid_block::{UNetMidBlock2D, UNetMidBlock2DConfig};
use crate::embeddings::{TimestepEmbedding, Timesteps};
use crate::sampler::DenoisingModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DownBlockType {
    DownBlock2D,
    AttnDownBlock2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UpBlockType {
    UpBlock2D,
    AttnUpBlock2D,
}

/// Mirror of the diffusers `UNet2DModel` configuration file. The defaults
/// describe the 32x32 CIFAR-10 checkpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UNet2DModelConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Edge length of the (square) samples the model was trained on.
    pub sample_size: usize,
    pub center_input_sample: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<DownBlockType>,
    pub up_block_types: Vec<UpBlockType>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub attention_head_dim: Option<usize>,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
}

impl Default for UNet2DModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            sample_size: 32,
            center_input_sample: false,
            flip_sin_to_cos: false,
            freq_shift: 1.,
            block_out_channels: vec![128, 256, 256, 256],
            down_block_types: vec![
                DownBlockType::DownBlock2D,
                DownBlockType::AttnDownBlock2D,
                DownBlockType::DownBlock2D,
                DownBlockType::DownBlock2D,
            ],
            up_block_types: vec![
                UpBlockType::UpBlock2D,
                UpBlockType::UpBlock2D,
                UpBlockType::AttnUpBlock2D,
                UpBlockType::UpBlock2D,
            ],
            layers_per_block: 2,
            downsample_padding: 0,
            attention_head_dim: None,
            norm_num_groups: 32,
            norm_eps: 1e-6,
        }
    }
}

#[derive(Debug)]
enum UNetDownBlock {
    Basic(DownBlock2D),
    Attn(AttnDownBlock2D),
}

#[derive(Debug)]
enum UNetUpBlock {
    Basic(UpBlock2D),
    Attn(AttnUpBlock2D),
}

#[derive(Debug)]
pub struct UNet2DModel {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock2D,
    up_blocks: Vec<UNetUpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
    span: tracing::Span,
    pub config: UNet2DModelConfig,
}

impl UNet2DModel {
    pub fn new(vs: nn::VarBuilder, config: UNet2DModelConfig) -> Result<Self> {
        let n_blocks = config.block_out_channels.len();
        if n_blocks == 0 {
            bail!("block_out_channels must not be empty")
        }
        if config.down_block_types.len() != n_blocks || config.up_block_types.len() != n_blocks {
            bail!(
                "expected {n_blocks} down and up block types, got {} and {}",
                config.down_block_types.len(),
                config.up_block_types.len()
            )
        }
        let b_channels = config.block_out_channels[0];
        let bl_channels = *config.block_out_channels.last().unwrap();
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            stride: 1,
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(
            config.in_channels,
            b_channels,
            3,
            conv_cfg,
            vs.pp("conv_in"),
        )?;

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let in_channels = if i > 0 {
                    config.block_out_channels[i - 1]
                } else {
                    b_channels
                };
                let out_channels = config.block_out_channels[i];
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                match config.down_block_types[i] {
                    DownBlockType::DownBlock2D => {
                        let block = DownBlock2D::new(
                            vs_db.pp(&i.to_string()),
                            in_channels,
                            out_channels,
                            Some(time_embed_dim),
                            db_cfg,
                        )?;
                        Ok(UNetDownBlock::Basic(block))
                    }
                    DownBlockType::AttnDownBlock2D => {
                        let block = AttnDownBlock2D::new(
                            vs_db.pp(&i.to_string()),
                            in_channels,
                            out_channels,
                            Some(time_embed_dim),
                            AttnDownBlock2DConfig {
                                downblock: db_cfg,
                                attention_head_dim: config.attention_head_dim,
                            },
                        )?;
                        Ok(UNetDownBlock::Attn(block))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DConfig {
            resnet_eps: config.norm_eps,
            resnet_groups: Some(config.norm_num_groups),
            attention_head_dim: config.attention_head_dim,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            mid_cfg,
        )?;

        let vs_ub = vs.pp("up_blocks");
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let out_channels = config.block_out_channels[n_blocks - 1 - i];
                let prev_output_channels = if i > 0 {
                    config.block_out_channels[n_blocks - i]
                } else {
                    bl_channels
                };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.block_out_channels[index]
                };
                let ub_cfg = UpBlock2DConfig {
                    num_layers: config.layers_per_block + 1,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_upsample: i < n_blocks - 1,
                    ..Default::default()
                };
                match config.up_block_types[i] {
                    UpBlockType::UpBlock2D => {
                        let block = UpBlock2D::new(
                            vs_ub.pp(&i.to_string()),
                            in_channels,
                            prev_output_channels,
                            out_channels,
                            Some(time_embed_dim),
                            ub_cfg,
                        )?;
                        Ok(UNetUpBlock::Basic(block))
                    }
                    UpBlockType::AttnUpBlock2D => {
                        let block = AttnUpBlock2D::new(
                            vs_ub.pp(&i.to_string()),
                            in_channels,
                            prev_output_channels,
                            out_channels,
                            Some(time_embed_dim),
                            AttnUpBlock2DConfig {
                                upblock: ub_cfg,
                                attention_head_dim: config.attention_head_dim,
                            },
                        )?;
                        Ok(UNetUpBlock::Attn(block))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out = nn::conv2d(
            b_channels,
            config.out_channels,
            3,
            conv_cfg,
            vs.pp("conv_out"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "unet2d");
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            span,
            config,
        })
    }

    pub fn forward(&self, xs: &Tensor, timestep: usize) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (bsize, _channels, height, width) = xs.dims4()?;
        let device = xs.device();
        let n_blocks = self.config.block_out_channels.len();
        let num_upsamplers = n_blocks - 1;
        let default_overall_up_factor = 2usize.pow(num_upsamplers as u32);
        let forward_upsample_size =
            height % default_overall_up_factor != 0 || width % default_overall_up_factor != 0;

        // 0. center input if necessary
        let xs = if self.config.center_input_sample {
            ((xs * 2.0)? - 1.0)?
        } else {
            xs.clone()
        };
        // 1. time
        let emb = (Tensor::ones(bsize, DType::F32, device)? * timestep as f64)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;
        // 2. pre-process
        let xs = self.conv_in.forward(&xs)?;
        // 3. down
        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (block_xs, res_xs) = match down_block {
                UNetDownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                UNetDownBlock::Attn(b) => b.forward(&xs, Some(&emb))?,
            };
            down_block_res_xs.extend(res_xs);
            xs = block_xs;
        }
        // 4. mid
        let mut xs = self.mid_block.forward(&xs, Some(&emb))?;
        // 5. up
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let n_resnets = match up_block {
                UNetUpBlock::Basic(b) => b.num_resnets(),
                UNetUpBlock::Attn(b) => b.num_resnets(),
            };
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - n_resnets);
            if i < n_blocks - 1 && forward_upsample_size {
                let (_, _, h, w) = down_block_res_xs.last().unwrap().dims4()?;
                upsample_size = Some((h, w))
            }
            xs = match up_block {
                UNetUpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size)?,
                UNetUpBlock::Attn(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size)?,
            };
        }
        // 6. post-process
        let xs = self.conv_norm_out.forward(&xs)?;
        let xs = nn::ops::silu(&xs)?;
        self.conv_out.forward(&xs)
    }
}

impl DenoisingModel for UNet2DModel {
    fn predict_noise(&self, latent: &Tensor, timestep: usize) -> Result<Tensor> {
        self.forward(latent, timestep)
    }
}
