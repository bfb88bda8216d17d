//! Wavefront-style split-kernel strategy: eleven short kernels that
//! advance many rays in lockstep, coordinated via device-resident queues
//! and per-ray state, with host-side convergence polling and adaptive
//! iteration counts. See spec.md §4.5.

pub mod arena;

use std::collections::HashMap;

use ocl::Kernel;

use crate::buffer_registry::read_blocking;
use crate::device::DeviceBase;
use crate::error::{DriverError, Result};
use crate::feasibility::{ceil_multiple, LX, LY};
use crate::program_cache::SharedProgram;
use crate::tile::{DeviceRequestedFeatures, DeviceTask, RenderTile};

use arena::{round_max_closure, SplitKernelArena};

pub const KERNEL_NAMES: &[&str] = &[
    "DataInit",
    "SceneIntersect",
    "LampEmission",
    "QueueEnqueue",
    "Background_BufferUpdate",
    "Shader_Lighting",
    "Holdout_Emission_Blurring_Pathtermination_AO",
    "DirectLighting",
    "ShadowBlocked_DirectLighting",
    "SetUpNextIteration",
    "SumAllRadiance",
];

/// The nine ping-pong stages enqueued every convergence-loop round, in
/// order. `ShadowBlocked_DirectLighting` gets a doubled `global_x`
/// (spec.md §4.5 step 5): it launches two rays per logical thread, one
/// for the AO shadow and one for the direct-lighting shadow.
const PING_PONG_STAGES: &[&str] = &[
    "SceneIntersect",
    "LampEmission",
    "QueueEnqueue",
    "Background_BufferUpdate",
    "Shader_Lighting",
    "Holdout_Emission_Blurring_Pathtermination_AO",
    "DirectLighting",
    "ShadowBlocked_DirectLighting",
    "SetUpNextIteration",
];

const RAY_INACTIVE: u8 = 0;

/// Step `PathIteration_times` decreases by (and floors at) when a tile
/// converges with zero host interventions.
pub const PATH_ITER_INC_FACTOR: u32 = 4;

/// Growth added per host intervention when a tile needed more than one
/// convergence round: `numNextPathIterTimes = initial + 8 * interventions`.
const PATH_ITER_HOST_INTERVENTION_STEP: u32 = 8;

/// Backstop against a tile that never converges (e.g. a kernel bug
/// leaving rays perpetually active) spinning the host loop forever.
const MAX_HOST_INTERVENTIONS: u32 = 64;

fn launch_error(kernel: &str, e: impl ToString) -> DriverError {
    DriverError::KernelLaunch {
        kernel: kernel.to_string(),
        source: e.to_string(),
    }
}

/// Eleven compiled programs/kernels, the tile arena, and the adaptive
/// `PathIteration_times` state that persists across tiles on one device.
pub struct SplitKernel {
    programs: HashMap<&'static str, SharedProgram>,
    kernels: HashMap<&'static str, Kernel>,
    loaded_max_closure: Option<u32>,
    arena: Option<SplitKernelArena>,
    path_iteration_times: u32,
    work_stealing: bool,
}

impl SplitKernel {
    pub fn new(initial_path_iteration_times: u32, work_stealing: bool) -> Self {
        Self {
            programs: HashMap::new(),
            kernels: HashMap::new(),
            loaded_max_closure: None,
            arena: None,
            path_iteration_times: initial_path_iteration_times.max(1),
            work_stealing,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.kernels.is_empty()
    }

    pub fn path_iteration_times(&self) -> u32 {
        self.path_iteration_times
    }

    /// Compiles all eleven kernels with `-D__SPLIT_KERNEL__
    /// -D__MAX_CLOSURE__=<m>` (`m` from `features.max_closure` rounded up
    /// to a multiple of 5, capped at `MAX_CLOSURE`). Kernels are only
    /// reloaded when `m` changes, per spec.md §4.5's stated rationale for
    /// rounding: fewer recompilations in interactive mode.
    pub fn load_kernels(
        &mut self,
        device: &DeviceBase,
        sources: &HashMap<&str, &str>,
        features: DeviceRequestedFeatures,
    ) -> Result<bool> {
        let m = round_max_closure(features.max_closure);
        if self.loaded_max_closure == Some(m) && self.is_loaded() {
            return Ok(true);
        }

        let extra = format!(
            "-D__SPLIT_KERNEL__ -D__MAX_CLOSURE__={m}{}",
            if self.work_stealing { " -D__WORK_STEALING__" } else { "" }
        );

        let mut programs = HashMap::new();
        let mut kernels = HashMap::new();
        for name in KERNEL_NAMES {
            let source = sources
                .get(name)
                .ok_or_else(|| launch_error(name, "no source provided for this kernel"))?;
            let program = device.load_program(name, source, &extra)?;
            let kernel = device
                .kernel_builder(&program.0, name)
                .build()
                .map_err(|e| launch_error(name, e))?;
            programs.insert(*name, program);
            kernels.insert(*name, kernel);
        }

        self.programs = programs;
        self.kernels = kernels;
        self.loaded_max_closure = Some(m);
        Ok(true)
    }

    fn kernel(&self, name: &str) -> Result<&Kernel> {
        self.kernels
            .get(name)
            .ok_or_else(|| launch_error(name, "kernel not loaded"))
    }

    /// Runs one tile through the wavefront pipeline. Allocates the arena
    /// on first use (sized to `max_feasible_elements`, the maximum
    /// feasible tile per spec.md §4.6), enqueues `DataInit` once, then
    /// repeats rounds of the nine ping-pong stages until a host-side
    /// `ray_state` scan finds nothing left active, then `SumAllRadiance`.
    pub fn path_trace(
        &mut self,
        device: &mut DeviceBase,
        tile: &mut RenderTile,
        max_feasible_elements: u64,
        task: &DeviceTask,
    ) -> Result<()> {
        if self.arena.is_none() {
            self.arena = Some(SplitKernelArena::new(
                device,
                max_feasible_elements,
                self.loaded_max_closure.unwrap_or(arena::MAX_CLOSURE),
            )?);
        }

        let global_y = ceil_multiple(tile.h, LY) as u64;
        let w = tile.w as u64;
        let num_parallel_samples = if self.work_stealing {
            1
        } else {
            let denom = (global_y * w).max(1);
            let max_parallel = (max_feasible_elements / denom).min(tile.num_samples.max(1) as u64);
            (max_parallel / 64).max(1) * 64
        };

        let global_x = ceil_multiple(tile.w, LX) as u64 * num_parallel_samples;
        let local = (LX as usize, LY as usize);

        self.enqueue(device, "DataInit", (global_x as usize, global_y as usize), local)?;

        let initial_iteration_times = self.path_iteration_times;
        let mut num_host_intervention = 0u32;
        loop {
            for _ in 0..self.path_iteration_times.max(1) {
                for stage in PING_PONG_STAGES {
                    let gx = if *stage == "ShadowBlocked_DirectLighting" {
                        global_x * 2
                    } else {
                        global_x
                    };
                    self.enqueue(device, stage, (gx as usize, global_y as usize), local)?;
                }
            }

            if !self.any_ray_active(device)? {
                break;
            }
            num_host_intervention += 1;
            if num_host_intervention >= MAX_HOST_INTERVENTIONS {
                log::warn!("split-kernel tile did not converge after {MAX_HOST_INTERVENTIONS} host interventions");
                break;
            }
            if task.get_cancel() && !task.need_finish_queue {
                break;
            }
        }

        self.enqueue(device, "SumAllRadiance", (global_x as usize, global_y as usize), (16, 16))?;

        self.path_iteration_times = if num_host_intervention == 0 {
            initial_iteration_times
                .saturating_sub(PATH_ITER_INC_FACTOR)
                .max(PATH_ITER_INC_FACTOR)
        } else {
            initial_iteration_times + PATH_ITER_HOST_INTERVENTION_STEP * num_host_intervention
        };

        tile.sample = tile.start_sample + tile.num_samples;
        device.finish()?;
        Ok(())
    }

    fn any_ray_active(&self, device: &DeviceBase) -> Result<bool> {
        let arena = self.arena.as_ref().expect("arena allocated before convergence loop");
        let mut ray_state = vec![0u8; arena.num_global_elements as usize];
        if let Some(buffer) = device.buffer_by_ptr(arena.ray_state) {
            read_blocking(device.queue(), buffer, &mut ray_state)
                .map_err(|e| launch_error("SceneIntersect", e))?;
        }
        Ok(ray_state.iter().any(|&b| b != RAY_INACTIVE))
    }

    fn enqueue(
        &self,
        device: &DeviceBase,
        name: &str,
        global: (usize, usize),
        local: (usize, usize),
    ) -> Result<()> {
        let kernel = self.kernel(name)?;
        unsafe {
            kernel
                .cmd()
                .queue(device.queue())
                .global_work_size(global)
                .local_work_size(local)
                .enq()
                .map_err(|e| launch_error(name, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unloaded_with_floored_iteration_times() {
        let sk = SplitKernel::new(1, false);
        assert!(!sk.is_loaded());
        assert_eq!(sk.path_iteration_times(), 1);
    }

    #[test]
    fn kernel_names_match_the_eleven_stage_pipeline() {
        assert_eq!(KERNEL_NAMES.len(), 11);
        assert_eq!(PING_PONG_STAGES.len(), 9);
        for stage in PING_PONG_STAGES {
            assert!(KERNEL_NAMES.contains(stage));
        }
    }
}
