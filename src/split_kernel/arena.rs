//! `SplitKernelArena`: the structure-of-arrays buffers the wavefront
//! pipeline reads and writes every iteration, sized once per tile and
//! reused across iterations. See spec.md §3, §4.5, §8 invariant 4.

use std::collections::HashMap;

use crate::buffer_registry::{MemKind, RAY_SOA_FIELDS};
use crate::device::DeviceBase;
use crate::error::Result;

/// Queues each ray is routed through between pipeline stages.
pub const NUM_QUEUES: u64 = 4;

/// Upper bound on shading closures per path, matching the kernel build
/// option `__MAX_CLOSURE__`'s ceiling.
pub const MAX_CLOSURE: u32 = 64;

const POINTER_SIZE: u64 = 8;
const INT_SIZE: u64 = 4;

/// `m` rounded up to the next multiple of 5, capped at `MAX_CLOSURE`, per
/// spec.md §8's boundary property for interactive `max_closure`.
pub fn round_max_closure(requested: u32) -> u32 {
    let rounded = requested.div_ceil(5) * 5;
    rounded.min(MAX_CLOSURE)
}

/// Per-element byte cost of the two SoA shader-data headers. Carries
/// forward a quirk noted in spec.md §9: the macro that expands one field
/// per closure variable adds `sizeof(void*)` twice — once inside the
/// (empty) macro body, once outside it — so the real allocation is
/// double what `max_closure` pointers alone would need. Do not "fix"
/// this; a reimplementation that allocates the intuitively-correct size
/// would undersize the buffer relative to what the kernels assume.
pub fn shaderdata_soa_size(max_closure: u32) -> u64 {
    let per_closure = POINTER_SIZE * 2;
    per_closure * max_closure as u64
}

/// Fixed-size bookkeeping struct mirrored into `__constant` memory every
/// device sees: counters, flags, nothing proportional to tile size.
pub fn kernel_globals_size() -> u64 {
    256
}

/// Everything allocated once per tile (at the maximum feasible size) and
/// reused by every sub-tile and every iteration of the convergence loop.
pub struct SplitKernelArena {
    pub num_global_elements: u64,
    pub max_closure: u32,
    soa: HashMap<&'static str, u64>, // field name -> device pointer (identity)
    pub ray_state: u64,
    pub queue_data: u64,
    pub queue_index: u64,
    pub use_queues_flag: u64,
    pub kernel_globals: u64,
    pub shader_data_sd: u64,
    pub shader_data_sd_dl: u64,
}

impl SplitKernelArena {
    /// Allocates every field sized for `num_global_elements` threads.
    /// `device.mem_alloc` registers each allocation so later argument
    /// binding can look it up by its opaque pointer.
    pub fn new(device: &mut DeviceBase, num_global_elements: u64, max_closure: u32) -> Result<Self> {
        let mut soa = HashMap::new();
        for field in RAY_SOA_FIELDS {
            let mem = device.mem_alloc(num_global_elements * POINTER_SIZE, MemKind::ReadWrite)?;
            soa.insert(*field, mem.identity());
        }

        let ray_state = device
            .mem_alloc(num_global_elements, MemKind::ReadWrite)?
            .identity();
        let queue_data = device
            .mem_alloc(num_global_elements * NUM_QUEUES * INT_SIZE, MemKind::ReadWrite)?
            .identity();
        let queue_index = device
            .mem_alloc(NUM_QUEUES * INT_SIZE, MemKind::ReadWrite)?
            .identity();
        let use_queues_flag = device.mem_alloc(INT_SIZE, MemKind::ReadWrite)?.identity();
        let kernel_globals = device
            .mem_alloc(kernel_globals_size(), MemKind::ReadWrite)?
            .identity();
        let shader_data_size = num_global_elements * shaderdata_soa_size(max_closure);
        let shader_data_sd = device.mem_alloc(shader_data_size, MemKind::ReadWrite)?.identity();
        let shader_data_sd_dl = device.mem_alloc(shader_data_size, MemKind::ReadWrite)?.identity();

        Ok(Self {
            num_global_elements,
            max_closure,
            soa,
            ray_state,
            queue_data,
            queue_index,
            use_queues_flag,
            kernel_globals,
            shader_data_sd,
            shader_data_sd_dl,
        })
    }

    pub fn soa_field(&self, name: &str) -> Option<u64> {
        self.soa.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_max_closure_boundary() {
        assert_eq!(round_max_closure(1), 5);
        assert_eq!(round_max_closure(5), 5);
        assert_eq!(round_max_closure(6), 10);
        assert_eq!(round_max_closure(MAX_CLOSURE + 50), MAX_CLOSURE);
    }

    #[test]
    fn shaderdata_soa_size_doubles_pointer_cost() {
        // The documented quirk: two pointer-widths per closure, not one.
        assert_eq!(shaderdata_soa_size(1), POINTER_SIZE * 2);
        assert_eq!(shaderdata_soa_size(10), POINTER_SIZE * 2 * 10);
    }
}
