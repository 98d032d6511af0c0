//! Denoising Diffusion Probabilistic Models
//!
//! The noise schedule behind the reverse process described in
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{linspace, BetaSchedule};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DdpmSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    #[serde(alias = "num_train_timesteps")]
    pub train_timesteps: usize,
}

impl Default for DdpmSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 1000,
        }
    }
}

impl DdpmSchedulerConfig {
    pub fn from_file<T: AsRef<Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: DdpmSchedulerConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.train_timesteps == 0 {
            return Err(Error::Configuration(
                "train_timesteps must be positive".to_string(),
            ));
        }
        if self.beta_start <= 0. {
            return Err(Error::Configuration(format!(
                "beta_start must be positive, got {}",
                self.beta_start
            )));
        }
        if self.beta_end >= 1. {
            return Err(Error::Configuration(format!(
                "beta_end must be below 1, got {}",
                self.beta_end
            )));
        }
        if self.beta_start >= self.beta_end {
            return Err(Error::Configuration(format!(
                "beta_start ({}) must be below beta_end ({})",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}

/// Schedule parameters for one reverse transition at a given timestep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub beta: f64,
    pub alpha: f64,
    pub alpha_bar: f64,
    /// `alpha_bar` at the next-smaller timestep of the active sequence,
    /// `1.0` at the terminal step.
    pub alpha_bar_prev: f64,
}

pub struct DdpmScheduler {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    pub config: DdpmSchedulerConfig,
}

impl DdpmScheduler {
    pub fn new(inference_steps: usize, config: DdpmSchedulerConfig) -> Result<Self> {
        config.validate()?;
        let train_timesteps = config.train_timesteps;
        if inference_steps == 0 {
            return Err(Error::Configuration(
                "inference_steps must be positive".to_string(),
            ));
        }
        if inference_steps > train_timesteps {
            return Err(Error::Configuration(format!(
                "inference_steps ({inference_steps}) cannot exceed train_timesteps ({train_timesteps})"
            )));
        }

        let betas = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, train_timesteps),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), train_timesteps)
                    .into_iter()
                    .map(|beta| beta * beta)
                    .collect()
            }
        };
        let alphas: Vec<f64> = betas.iter().map(|beta| 1. - beta).collect();
        let mut alphas_cumprod = Vec::with_capacity(train_timesteps);
        for &alpha in alphas.iter() {
            alphas_cumprod.push(alpha * alphas_cumprod.last().copied().unwrap_or(1.))
        }

        // Uniform sub-sampling of [0, train_timesteps - 1], visited high to low.
        let stride = train_timesteps as f64 / inference_steps as f64;
        let mut timesteps: Vec<usize> = (0..inference_steps)
            .map(|s| (s as f64 * stride).round() as usize)
            .collect();
        timesteps.dedup();
        timesteps.reverse();

        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
            timesteps,
            config,
        })
    }

    /// The active timestep sequence, in the order the sampler visits it.
    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn train_timesteps(&self) -> usize {
        self.config.train_timesteps
    }

    /// Schedule parameters at `timestep`, which must belong to the active
    /// sequence so that the preceding `alpha_bar` can be resolved.
    pub fn params_at(&self, timestep: usize) -> Result<StepParams> {
        let position = self
            .timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "timestep {timestep} is not part of the active sequence"
                ))
            })?;
        let alpha_bar_prev = match self.timesteps.get(position + 1) {
            Some(&prev) => self.alphas_cumprod[prev],
            None => 1.,
        };
        Ok(StepParams {
            beta: self.betas[timestep],
            alpha: self.alphas[timestep],
            alpha_bar: self.alphas_cumprod[timestep],
            alpha_bar_prev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(inference_steps: usize) -> DdpmScheduler {
        DdpmScheduler::new(inference_steps, DdpmSchedulerConfig::default()).unwrap()
    }

    #[test]
    fn alphas_cumprod_strictly_decreasing_in_unit_interval() {
        let s = scheduler(50);
        assert_eq!(s.alphas_cumprod.len(), 1000);
        assert_eq!(s.alphas_cumprod[0], s.alphas[0]);
        for pair in s.alphas_cumprod.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        for &v in s.alphas_cumprod.iter() {
            assert!(v > 0. && v <= 1.);
        }
    }

    #[test]
    fn scaled_linear_squares_the_interpolated_sqrt() {
        let config = DdpmSchedulerConfig {
            beta_schedule: BetaSchedule::ScaledLinear,
            ..Default::default()
        };
        let s = DdpmScheduler::new(10, config).unwrap();
        assert!((s.betas[0] - 0.0001).abs() < 1e-12);
        assert!((s.betas[999] - 0.02).abs() < 1e-12);
        // The square of a linear ramp is convex, so the midpoint sits below
        // the linear midpoint.
        let linear_mid = (0.0001 + 0.02) / 2.;
        assert!(s.betas[500] < linear_mid);
    }

    #[test]
    fn timesteps_are_descending_unique_and_complete() {
        for n in [1usize, 7, 50, 333, 999, 1000] {
            let s = scheduler(n);
            let steps = s.timesteps();
            assert_eq!(steps.len(), n, "expected exactly {n} steps");
            for pair in steps.windows(2) {
                assert!(pair[0] > pair[1]);
            }
            assert!(*steps.first().unwrap() <= 999);
            assert_eq!(*steps.last().unwrap(), 0);
        }
    }

    #[test]
    fn fifty_step_sequence_matches_even_spacing() {
        let s = scheduler(50);
        let expected: Vec<usize> = (0..50).map(|i| i * 20).rev().collect();
        assert_eq!(s.timesteps(), expected.as_slice());
        assert_eq!(s.timesteps()[0], 980);
        assert_eq!(*s.timesteps().last().unwrap(), 0);
    }

    #[test]
    fn rejects_invalid_step_counts() {
        assert!(matches!(
            DdpmScheduler::new(0, DdpmSchedulerConfig::default()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            DdpmScheduler::new(1001, DdpmSchedulerConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn rejects_invalid_beta_ranges() {
        let bad = [
            DdpmSchedulerConfig {
                beta_start: 0.,
                ..Default::default()
            },
            DdpmSchedulerConfig {
                beta_end: 1.,
                ..Default::default()
            },
            DdpmSchedulerConfig {
                beta_start: 0.02,
                beta_end: 0.0001,
                ..Default::default()
            },
            DdpmSchedulerConfig {
                train_timesteps: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                DdpmScheduler::new(1, config),
                Err(Error::Configuration(_))
            ));
        }
    }

    #[test]
    fn params_resolve_prev_from_the_active_sequence() {
        let s = scheduler(50);
        let params = s.params_at(980).unwrap();
        assert_eq!(params.beta, s.betas[980]);
        assert_eq!(params.alpha, 1. - s.betas[980]);
        assert_eq!(params.alpha_bar_prev, s.alphas_cumprod[960]);

        let terminal = s.params_at(0).unwrap();
        assert_eq!(terminal.alpha_bar_prev, 1.);
        assert!(s.params_at(981).is_err());
    }

    #[test]
    fn single_step_sequence_is_the_origin() {
        let s = scheduler(1);
        assert_eq!(s.timesteps(), &[0]);
        assert_eq!(s.params_at(0).unwrap().alpha_bar_prev, 1.);
    }

    #[test]
    fn scheduler_config_roundtrips_through_diffusers_json() {
        let json = r#"{
            "_class_name": "DDPMScheduler",
            "beta_end": 0.02,
            "beta_schedule": "linear",
            "beta_start": 0.0001,
            "clip_sample": true,
            "num_train_timesteps": 1000,
            "variance_type": "fixed_small"
        }"#;
        let cfg: DdpmSchedulerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.train_timesteps, 1000);
        assert_eq!(cfg.beta_schedule, BetaSchedule::Linear);
        assert_eq!(cfg.beta_start, 0.0001);
    }
}
