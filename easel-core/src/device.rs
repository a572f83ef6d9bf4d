use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};

/// Where the caller wants inference placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePreference {
    #[default]
    Auto,
    ForceCpu,
}

/// Picks the best available device for `pref` along with the dtype models are
/// loaded in: F16 on accelerators, F32 on CPU.
pub fn select_device(pref: DevicePreference) -> Result<(Device, DType)> {
    let device = match pref {
        DevicePreference::ForceCpu => Device::Cpu,
        DevicePreference::Auto if cuda_is_available() => Device::new_cuda(0)?,
        DevicePreference::Auto if metal_is_available() => Device::new_metal(0)?,
        DevicePreference::Auto => {
            tracing::info!("no accelerator available, running on CPU");
            Device::Cpu
        }
    };
    let dtype = if matches!(device, Device::Cpu) {
        DType::F32
    } else {
        DType::F16
    };
    Ok((device, dtype))
}
