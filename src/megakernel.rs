//! Per-tile, per-sample dispatch of one monolithic path-trace kernel.
//! See spec.md §4.4.

use ocl::Kernel;

use crate::buffer_registry::TEXTURE_SLOTS;
use crate::device::DeviceBase;
use crate::error::{DriverError, Result};
use crate::program_cache::SharedProgram;
use crate::tile::{DeviceTask, RenderTile};

pub const KERNEL_NAME: &str = "kernel_ocl_path_trace";

fn launch_error(e: impl ToString) -> DriverError {
    DriverError::KernelLaunch {
        kernel: KERNEL_NAME.to_string(),
        source: e.to_string(),
    }
}

/// One program, one kernel, dispatched once per sample per tile.
pub struct Megakernel {
    source: String,
    program: Option<SharedProgram>,
    kernel: Option<Kernel>,
}

impl Megakernel {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            program: None,
            kernel: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.kernel.is_some()
    }

    /// Compile (or load from cache) the program and build the kernel
    /// object. Idempotent: a second call after a successful first is a
    /// no-op, per spec.md §8's round-trip property.
    pub fn load_kernels(&mut self, device: &DeviceBase) -> Result<bool> {
        if self.is_loaded() {
            return Ok(true);
        }

        let program = device.load_program(KERNEL_NAME, &self.source, "")?;
        let placeholder = device.registry.null_sentinel();

        let mut builder = device.kernel_builder(&program.0, KERNEL_NAME);
        builder.arg_named("data", placeholder);
        builder.arg_named("buffer", placeholder);
        builder.arg_named("rng_state", placeholder);
        for name in TEXTURE_SLOTS {
            builder.arg_named(*name, placeholder);
        }
        builder.arg_named("sample", 0i32);
        builder.arg_named("x", 0i32);
        builder.arg_named("y", 0i32);
        builder.arg_named("w", 0i32);
        builder.arg_named("h", 0i32);
        builder.arg_named("offset", 0i32);
        builder.arg_named("stride", 0i32);

        let kernel = builder.build().map_err(launch_error)?;

        self.program = Some(program);
        self.kernel = Some(kernel);
        Ok(true)
    }

    /// Runs `path_trace(tile, sample)` for every sample in
    /// `[tile.start_sample, tile.start_sample + tile.num_samples)`,
    /// checking `task.get_cancel()` between samples. A `clFlush` (not a
    /// `clFinish`, per spec.md §9) follows each enqueue so the in-order
    /// queue carries the ordering guarantee instead of a round-trip wait;
    /// a `clFinish` precedes return so a fast device is never blocked in
    /// `release_tile` behind a slower one.
    pub fn path_trace(&self, device: &DeviceBase, tile: &mut RenderTile, task: &DeviceTask) -> Result<()> {
        if !device.registry.has_data_constant() {
            return Err(launch_error("'__data' constant not populated before dispatch"));
        }
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| launch_error("load_kernels was not called or failed"))?;

        let (local, global) = device.geometry_for(kernel, [tile.w as usize, tile.h as usize])?;

        self.bind_fixed_args(device, kernel, tile)?;

        let end_sample = tile.start_sample + tile.num_samples;
        let mut sample = tile.start_sample;
        while sample < end_sample {
            if task.get_cancel() && !task.need_finish_queue {
                break;
            }

            kernel.set_arg_named("sample", sample as i32).map_err(launch_error)?;

            unsafe {
                kernel
                    .cmd()
                    .queue(device.queue())
                    .global_work_size(global)
                    .local_work_size(local)
                    .enq()
                    .map_err(launch_error)?;
            }

            device.queue().flush().map_err(launch_error)?;

            sample += 1;
            tile.sample = sample;
        }

        device.finish()?;
        Ok(())
    }

    fn bind_fixed_args(&self, device: &DeviceBase, kernel: &Kernel, tile: &RenderTile) -> Result<()> {
        let data = device
            .registry
            .constant("__data")
            .ok_or_else(|| launch_error("'__data' constant not populated before dispatch"))?;
        kernel.set_arg_named("data", data).map_err(launch_error)?;

        if let Some(buffer) = device.buffer_by_ptr(tile.buffer) {
            kernel.set_arg_named("buffer", buffer).map_err(launch_error)?;
        }
        if let Some(rng_state) = device.buffer_by_ptr(tile.rng_state) {
            kernel.set_arg_named("rng_state", rng_state).map_err(launch_error)?;
        }

        let textures = device.registry.bind_textures();
        for (name, buffer) in TEXTURE_SLOTS.iter().zip(textures.iter()) {
            kernel.set_arg_named(*name, *buffer).map_err(launch_error)?;
        }

        kernel.set_arg_named("x", tile.x as i32).map_err(launch_error)?;
        kernel.set_arg_named("y", tile.y as i32).map_err(launch_error)?;
        kernel.set_arg_named("w", tile.w as i32).map_err(launch_error)?;
        kernel.set_arg_named("h", tile.h as i32).map_err(launch_error)?;
        kernel.set_arg_named("offset", tile.offset).map_err(launch_error)?;
        kernel.set_arg_named("stride", tile.stride as i32).map_err(launch_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unloaded() {
        let mk = Megakernel::new("kernel void kernel_ocl_path_trace() {}");
        assert!(!mk.is_loaded());
    }
}
