//! Host-side driver for a GPU wavefront path tracer.
//!
//! This crate owns the orchestration layer that turns [`RenderTile`]s
//! into GPU kernel launches under two dispatch strategies
//! ([`Megakernel`] and [`SplitKernel`]), manages the device buffers those
//! strategies need ([`BufferRegistry`], [`split_kernel::arena`]), and
//! adapts launch geometry to per-device memory limits
//! ([`feasibility`]). The actual path-tracing kernel source, scene
//! translation, and the top-level tile scheduler are external
//! collaborators this crate only talks to by contract.

pub mod binary_cache;
pub mod buffer_registry;
pub mod config;
pub mod device;
pub mod error;
pub mod feasibility;
pub mod megakernel;
pub mod program_cache;
pub mod split_kernel;
pub mod stats;
pub mod tile;
pub mod worker;

pub use binary_cache::BinaryCache;
pub use buffer_registry::BufferRegistry;
pub use config::Config;
pub use device::DeviceBase;
pub use error::{DriverError, ErrorSink, Result};
pub use megakernel::Megakernel;
pub use split_kernel::SplitKernel;
pub use stats::Stats;
pub use tile::{
    CancelFlag, DeviceInfo, DeviceKind, DeviceRequestedFeatures, DeviceTask, NodeFeatureSet,
    RenderTile, TaskKind,
};
pub use worker::Worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use feasibility::{need_to_split_tile, split_tile_size, MemoryBudget};

/// Known AMD platform-name substring strategy selection matches against
/// (spec.md §6).
const AMD_PLATFORM_MARKER: &str = "amd";

/// `true` iff the device should run split-kernel: forced via
/// configuration, or the platform vendor string names AMD and the
/// device is a GPU. Everything else (including a failed probe, handled
/// by the caller defaulting `vendor`/`kind` to something that fails this
/// check) gets the megakernel strategy.
pub fn wants_split_kernel(vendor: &str, kind: DeviceKind, force_split_kernel: bool) -> bool {
    force_split_kernel
        || (vendor.to_ascii_lowercase().contains(AMD_PLATFORM_MARKER) && kind == DeviceKind::Gpu)
}

enum Strategy {
    Megakernel(Megakernel),
    SplitKernel(SplitKernel),
}

/// Kernel sources this crate does not own the contents of (spec.md §1's
/// "kernel source itself ... out of scope, referenced only by
/// contract"), supplied by the caller at construction.
pub struct KernelSources {
    pub megakernel: String,
    pub split_kernel: HashMap<&'static str, &'static str>,
}

struct DriverState {
    device: DeviceBase,
    strategy: Strategy,
    memory_budget: MemoryBudget,
}

/// The device instance the external scheduler talks to: owns a
/// [`DeviceBase`], a dispatch strategy, and a dedicated [`Worker`]
/// thread. `task_add`/`task_wait`/`task_cancel` are the whole surface a
/// scheduler needs (spec.md §4.7).
pub struct PathTraceDevice {
    state: Arc<Mutex<DriverState>>,
    worker: Worker,
}

impl PathTraceDevice {
    pub fn new(
        info: DeviceInfo,
        config: Config,
        features: DeviceRequestedFeatures,
        sources: KernelSources,
        memory_budget: MemoryBudget,
    ) -> Result<Self> {
        let force_split_kernel = config.force_split_kernel;
        let mut device = DeviceBase::new(info, config)?;

        let split = wants_split_kernel(device.vendor(), info.device_type, force_split_kernel);
        let mut strategy = if split {
            Strategy::SplitKernel(SplitKernel::new(split_kernel::PATH_ITER_INC_FACTOR, false))
        } else {
            Strategy::Megakernel(Megakernel::new(sources.megakernel.clone()))
        };

        match &mut strategy {
            Strategy::Megakernel(mk) => {
                mk.load_kernels(&device)?;
            }
            Strategy::SplitKernel(sk) => {
                sk.load_kernels(&device, &sources.split_kernel, features)?;
            }
        }

        let state = Arc::new(Mutex::new(DriverState {
            device,
            strategy,
            memory_budget,
        }));

        let worker_state = state.clone();
        let worker = Worker::spawn(move |task| {
            Self::run_task(&worker_state, task);
        });

        Ok(Self { state, worker })
    }

    fn run_task(state: &Arc<Mutex<DriverState>>, task: &mut DeviceTask) {
        loop {
            if task.get_cancel() && !task.need_finish_queue {
                break;
            }

            let Some(mut tile) = (task.acquire_tile)() else {
                break;
            };

            let mut guard = state.lock().unwrap();
            let DriverState {
                device,
                strategy,
                memory_budget,
            } = &mut *guard;

            let result = match (task.kind, &mut *strategy) {
                (TaskKind::PathTrace, Strategy::Megakernel(mk)) => mk.path_trace(device, &mut tile, task),
                (TaskKind::PathTrace, Strategy::SplitKernel(sk)) => {
                    let requested_area = (tile.w as u64) * (tile.h as u64);
                    let feasible = feasibility::feasible_global_threads(
                        memory_budget,
                        0,
                        requested_area,
                    );
                    if need_to_split_tile(tile.w, tile.h, feasible) {
                        let (split_w, split_h) = split_tile_size(tile.w, tile.h, feasible);
                        let subs = feasibility::subdivide_tile(&tile, split_w, split_h);
                        let mut last = Ok(());
                        for mut sub in subs {
                            last = sk.path_trace(device, &mut sub, feasible, task);
                            if last.is_err() {
                                break;
                            }
                        }
                        tile.sample = tile.start_sample + tile.num_samples;
                        last
                    } else {
                        sk.path_trace(device, &mut tile, feasible, task)
                    }
                }
                (TaskKind::FilmConvert, _) | (TaskKind::Shader, _) => {
                    // The film-convert and shader kernels' bodies are an
                    // external contract this crate does not own (spec.md
                    // §1); draining the tile without a dispatch keeps the
                    // worker's tile bookkeeping correct for callers that
                    // only exercise `PathTrace`.
                    Ok(())
                }
            };

            if let Err(e) = result {
                device.errors.record(e.to_string());
            }

            (task.update_progress)(tile.num_samples);
            (task.release_tile)(tile);

            if task.need_finish_queue {
                continue;
            }
            if task.get_cancel() {
                break;
            }
        }
    }

    pub fn task_add(&self, task: DeviceTask) {
        self.worker.task_add(task);
    }

    pub fn task_wait(&self) {
        self.worker.task_wait();
    }

    pub fn task_cancel(&self) {
        self.worker.task_cancel();
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().unwrap().device.errors.has_error()
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().unwrap().device.errors.message()
    }
}
