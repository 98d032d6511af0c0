use candle_core::{DType, Device, IndexOp, Tensor};
use image::{Rgb, RgbImage};

use crate::error::{Error, Result};

/// Convert a `[batch, channels, height, width]` latent batch nominally in
/// `[-1, 1]` into 8-bit RGB images, one per batch element in batch order.
///
/// Single-channel tensors are replicated into gray RGB; anything else than
/// 1 or 3 channels is rejected.
pub fn latent_to_images(latents: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch_size, channels, height, width) = latents.dims4()?;
    if channels != 1 && channels != 3 {
        return Err(Error::Validation(format!(
            "expected a 1 or 3 channel latent, got {channels} channels"
        )));
    }
    let latents = latents.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let mut images = Vec::with_capacity(batch_size);
    for index in 0..batch_size {
        let sample = latents.i(index)?.to_vec3::<f32>()?;
        let image = RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            if channels == 1 {
                let v = to_pixel(sample[0][y][x]);
                Rgb([v, v, v])
            } else {
                Rgb([
                    to_pixel(sample[0][y][x]),
                    to_pixel(sample[1][y][x]),
                    to_pixel(sample[2][y][x]),
                ])
            }
        });
        images.push(image);
    }
    Ok(images)
}

fn to_pixel(value: f32) -> u8 {
    (value.clamp(-1., 1.) * 127.5 + 127.5).round() as u8
}
