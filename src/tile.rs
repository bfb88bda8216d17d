//! Data model shared by both dispatch strategies: device identity, the
//! task handed down by the external scheduler, and the rectangular tile
//! each task is broken into.

use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A platform/device pair identified by a flat integer across all
/// platforms, as handed to us by the (external) device-enumeration
/// bootstrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    /// Flat index across all platforms' devices.
    pub num: i64,
    pub platform_name: String,
    pub device_type: DeviceKind,
}

impl DeviceInfo {
    pub fn new(num: i64, platform_name: impl Into<String>, device_type: DeviceKind) -> Self {
        Self {
            num,
            platform_name: platform_name.into(),
            device_type,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

bitflags! {
    /// Shading feature subset the kernels were compiled for, compiled
    /// into the split-kernel build options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFeatureSet: u32 {
        const CAMERA    = 1 << 0;
        const VOLUME    = 1 << 1;
        const HAIR      = 1 << 2;
        const SUBSURFACE = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceRequestedFeatures {
    pub max_closure: u32,
    pub max_nodes_group: u32,
    pub nodes_features: NodeFeatureSet,
}

/// The kind of work a `DeviceTask` asks the worker to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    FilmConvert,
    Shader,
    PathTrace,
}

/// Cooperative cancellation flag shared between the scheduler and the
/// device worker.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A request handed down by the external scheduler. Owned by the worker
/// for the lifetime of one execution; `acquire_tile`/`release_tile` are
/// callbacks into that scheduler.
pub struct DeviceTask {
    pub kind: TaskKind,
    pub num_samples: u32,
    /// If set, cancellation does not interrupt the tile currently in
    /// flight — the worker finishes it and only checks for cancellation
    /// between tiles.
    pub need_finish_queue: bool,
    pub cancel: CancelFlag,
    pub acquire_tile: Box<dyn FnMut() -> Option<RenderTile> + Send>,
    pub release_tile: Box<dyn FnMut(RenderTile) + Send>,
    pub update_progress: Box<dyn FnMut(u32) + Send>,
}

impl DeviceTask {
    pub fn get_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A rectangular region of the image, rendered as a unit.
///
/// `buffer` and `rng_state` are opaque device-pointer handles (raw
/// `u64`s, not typed GPU handles) so this module has no dependency on the
/// OpenCL backend: the split-kernel extension fields describe a sub-tile
/// view over the same parent buffers.
#[derive(Clone, Copy, Debug)]
pub struct RenderTile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub start_sample: u32,
    pub num_samples: u32,
    pub sample: u32,
    pub stride: u32,
    pub offset: i32,
    pub buffer: u64,
    pub rng_state: u64,

    // Split-kernel sub-tile view over the parent buffers.
    pub buffer_offset_x: u32,
    pub buffer_offset_y: u32,
    pub rng_state_offset_x: u32,
    pub rng_state_offset_y: u32,
    pub buffer_rng_state_stride: u32,
}

impl RenderTile {
    pub fn new(x: u32, y: u32, w: u32, h: u32, start_sample: u32, num_samples: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            start_sample,
            num_samples,
            sample: start_sample,
            stride: w,
            offset: 0,
            buffer: 0,
            rng_state: 0,
            buffer_offset_x: 0,
            buffer_offset_y: 0,
            rng_state_offset_x: 0,
            rng_state_offset_y: 0,
            buffer_rng_state_stride: 0,
        }
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_shares_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
