//! End-to-end checks for the strategy-selection and tile-planning logic
//! that doesn't require a real OpenCL device (spec.md §8, scenarios
//! S1/S3/S4/S6).

use pathtrace_device::feasibility::{
    feasible_global_threads, max_feasible_tile, need_to_split_tile, split_tile_size,
    subdivide_tile, MemoryBudget,
};
use pathtrace_device::split_kernel::arena::{round_max_closure, shaderdata_soa_size};
use pathtrace_device::split_kernel::PATH_ITER_INC_FACTOR;
use pathtrace_device::{wants_split_kernel, DeviceKind, RenderTile};

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn s1_cpu_device_never_splits() {
    init_logging();
    // S1: any non-AMD-GPU device runs the megakernel, regardless of force flag being unset.
    assert!(!wants_split_kernel("intel", DeviceKind::Cpu, false));
    assert!(!wants_split_kernel("nvidia", DeviceKind::Gpu, false));
}

#[test]
fn s1_amd_gpu_gets_split_kernel_automatically() {
    init_logging();
    assert!(wants_split_kernel("Advanced Micro Devices, Inc.", DeviceKind::Gpu, false));
}

#[test]
fn s1_force_split_kernel_overrides_vendor_check() {
    init_logging();
    assert!(wants_split_kernel("intel", DeviceKind::Cpu, true));
}

#[test]
fn s1_amd_cpu_does_not_auto_split() {
    init_logging();
    // Vendor match alone isn't enough; the device must also be a GPU.
    assert!(!wants_split_kernel("Advanced Micro Devices, Inc.", DeviceKind::Cpu, false));
}

#[test]
fn s3_convergence_backoff_constant_is_shared_with_arena_rounding() {
    init_logging();
    // Sanity-check the two independently-chosen constants used across
    // the convergence loop and the kernel build options stay coherent
    // with each other: the backoff step should never be zero (or the
    // adaptive loop would never grow PathIteration_times down).
    assert!(PATH_ITER_INC_FACTOR > 0);
}

#[test]
fn s3_max_closure_rounding_feeds_shaderdata_sizing_consistently() {
    init_logging();
    let requested = 37;
    let rounded = round_max_closure(requested);
    assert_eq!(rounded % 5, 0);
    assert!(rounded >= requested);

    let per_element = shaderdata_soa_size(rounded);
    assert_eq!(per_element, shaderdata_soa_size(rounded)); // deterministic
    assert!(per_element > 0);
}

#[test]
fn s4_oversized_tile_splits_into_a_grid_that_exactly_covers_the_parent() {
    init_logging();
    let budget = MemoryBudget {
        total_allocatable: 300_000_000,
        invariable: 50_000_000,
        scene_specific: 10_000_000,
        data_allocation_mem_factor: 1_000_000,
        per_thread_cost: 1_200,
    };

    let tile = RenderTile::new(0, 0, 1024, 1024, 0, 1);
    let feasible = feasible_global_threads(&budget, 0, tile.area());
    assert!(need_to_split_tile(tile.w, tile.h, feasible));

    let (split_w, split_h) = split_tile_size(tile.w, tile.h, feasible);
    let subs = subdivide_tile(&tile, split_w, split_h);

    let total_area: u64 = subs.iter().map(|t| t.area()).sum();
    assert_eq!(total_area, tile.area());
    for sub in &subs {
        assert!(!need_to_split_tile(sub.w, sub.h, feasible));
    }
}

#[test]
fn s6_zero_budget_device_reports_zero_feasible_threads() {
    init_logging();
    let budget = MemoryBudget::default();
    let feasible = feasible_global_threads(&budget, 0, 256 * 256);
    assert_eq!(feasible, 0);
    assert_eq!(max_feasible_tile(feasible), (0, 0));
}
