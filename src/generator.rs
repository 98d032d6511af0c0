use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Deterministic source of standard-normal tensors.
///
/// One instance backs exactly one sampling call: two generators built from
/// the same seed and driven with the same sequence of draws produce
/// byte-identical output, which is what makes generation reproducible.
pub struct NoiseGenerator {
    rng: StdRng,
    seed: u64,
}

impl NoiseGenerator {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// A `[batch, channels, height, width]` tensor of independent N(0, 1)
    /// draws, advancing the generator state.
    pub fn standard_normal(
        &mut self,
        shape: (usize, usize, usize, usize),
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let (b, c, h, w) = shape;
        let samples: Vec<f32> = StandardNormal
            .sample_iter(&mut self.rng)
            .take(b * c * h * w)
            .collect();
        Tensor::from_vec(samples, shape, device)
    }
}
