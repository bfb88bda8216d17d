//! Run-time configuration read from the environment once, at device
//! construction, so the rest of the crate never touches `std::env` again.

use std::path::PathBuf;

/// `CYCLES_OPENCL_TEST` device-type filter, applied at platform/device
/// discovery (the discovery loop itself lives in the external bootstrap
/// this crate does not own; `DeviceTypeFilter` is what that bootstrap is
/// expected to pass in).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceTypeFilter {
    All,
    Default,
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceTypeFilter {
    fn from_env_str(s: &str) -> Self {
        match s {
            "DEFAULT" => Self::Default,
            "CPU" => Self::Cpu,
            "GPU" => Self::Gpu,
            "ACCELERATOR" => Self::Accelerator,
            _ => Self::All,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device_type_filter: DeviceTypeFilter,
    /// `CYCLES_OPENCL_DEBUG`: dump kernel source and add
    /// `-D__KERNEL_OPENCL_DEBUG__` to build flags.
    pub debug: bool,
    /// `CYCLES_OPENCL_SPLIT_KERNEL_TEST`: force split-kernel strategy
    /// regardless of what device probing would otherwise pick.
    pub force_split_kernel: bool,
    /// Directory binary-cache files are written under.
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            device_type_filter: std::env::var("CYCLES_OPENCL_TEST")
                .map(|v| DeviceTypeFilter::from_env_str(&v))
                .unwrap_or(DeviceTypeFilter::All),
            debug: std::env::var_os("CYCLES_OPENCL_DEBUG").is_some(),
            force_split_kernel: std::env::var_os("CYCLES_OPENCL_SPLIT_KERNEL_TEST").is_some(),
            cache_dir: Self::default_cache_dir(),
        }
    }

    fn default_cache_dir() -> PathBuf {
        std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
            .unwrap_or_else(std::env::temp_dir)
            .join("cycles")
    }

    #[cfg(test)]
    pub fn for_test(cache_dir: PathBuf) -> Self {
        Self {
            device_type_filter: DeviceTypeFilter::All,
            debug: false,
            force_split_kernel: false,
            cache_dir,
        }
    }
}
