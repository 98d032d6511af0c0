use candle_core::{Device, Result};

/// Pick the best available device unless the caller forces CPU.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Device::cuda_if_available(0)
    }
}
