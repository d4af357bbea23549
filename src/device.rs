//! Compute device selection.

use candle_core::Device;

use crate::{Error, Result};

/// Pick the device for a run.
///
/// An explicit CUDA request fails with [`Error::Device`] instead of silently
/// falling back to the CPU.
pub fn select_device(use_cuda: bool, ordinal: usize) -> Result<Device> {
    if !use_cuda {
        return Ok(Device::Cpu);
    }
    if !candle_core::utils::cuda_is_available() {
        return Err(Error::Device(
            "CUDA requested but this build has no CUDA support (enable the `cuda` feature)".into(),
        ));
    }
    Device::new_cuda(ordinal)
        .map_err(|e| Error::Device(format!("failed to open CUDA device {ordinal}: {e}")))
}
