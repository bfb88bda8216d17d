//! Error kinds and the first-error latch described in the driver's error
//! handling contract.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Errors surfaced by kernel compilation, memory transfer, and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("platform discovery failed: {0}")]
    PlatformDiscovery(String),

    #[error("no OpenCL devices found")]
    NoDevicesFound,

    #[error("platform/device version too low: found {found:?}, require {required:?}")]
    VersionTooLow {
        found: (u32, u32),
        required: (u32, u32),
    },

    #[error("context creation failed: {0}")]
    ContextCreation(String),

    #[error("failed to allocate {bytes} bytes: {source}")]
    BufferAllocation { bytes: u64, source: String },

    #[error("kernel '{kernel}' launch failed: {source}")]
    KernelLaunch { kernel: String, source: String },

    #[error("binary cache load failed: {0}")]
    BinaryLoadFailed(String),

    #[error("source compilation failed:\n{log}")]
    SourceCompileFailed { log: String },

    #[error("failed to write binary cache file {path:?}: {source}")]
    BinarySaveFailed { path: PathBuf, source: String },

    #[error("memory transfer failed: {0}")]
    MemoryTransfer(String),

    #[error("readback failed: {0}")]
    ReadbackFailed(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Latches the first error message recorded against a device instance.
/// Subsequent calls are logged but never overwrite the latched value,
/// matching the propagation policy: the render tile keeps going with
/// whatever sample count it has until the caller observes this.
#[derive(Default)]
pub struct ErrorSink {
    latched: Mutex<Option<String>>,
    has_error: AtomicBool,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Only the first call per instance sticks; later
    /// calls are logged at `error` level and dropped.
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        if self
            .has_error
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::error!("{message}");
            *self.latched.lock().unwrap() = Some(message);
        } else {
            log::error!("(suppressed, first error already latched) {message}");
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn message(&self) -> Option<String> {
        self.latched.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_first_error_only() {
        let sink = ErrorSink::new();
        assert!(!sink.has_error());
        sink.record("first");
        sink.record("second");
        assert_eq!(sink.message().as_deref(), Some("first"));
    }
}
