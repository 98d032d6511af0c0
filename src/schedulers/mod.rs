use serde::{Deserialize, Serialize};

pub mod ddpm;

pub use ddpm::{DdpmScheduler, DdpmSchedulerConfig, StepParams};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

/// `steps` evenly spaced values over `[start, stop]`, both ends included.
pub(crate) fn linspace(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    if steps <= 1 {
        vec![start; steps]
    } else {
        let delta = (stop - start) / (steps - 1) as f64;
        (0..steps).map(|step| start + step as f64 * delta).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let vs = linspace(0.0001, 0.02, 1000);
        assert_eq!(vs.len(), 1000);
        assert_eq!(vs[0], 0.0001);
        assert!((vs[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_load_ddpm_config() {
        let cfg = DdpmSchedulerConfig::from_file("src/schedulers/config.ddpm.default.toml").unwrap();
        assert_eq!(cfg.beta_schedule, BetaSchedule::Linear);
        assert_eq!(cfg.train_timesteps, 1000);
    }
}
