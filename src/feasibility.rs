//! Tile feasibility planning: decide whether a requested tile fits in a
//! device's memory budget and, if not, subdivide it into sub-tiles sized
//! to the split-kernel local work-group multiple. See spec.md §4.6.

use crate::tile::RenderTile;

/// Local work-group dimensions the split kernel launches with; every
/// feasible tile dimension is rounded to a multiple of these.
pub const LX: u32 = 64;
pub const LY: u32 = 1;

pub fn ceil_multiple(value: u32, multiple: u32) -> u32 {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple) * multiple
}

fn floor_multiple(value: u32, multiple: u32) -> u32 {
    debug_assert!(multiple > 0);
    (value / multiple) * multiple
}

/// The memory buckets spec.md §4.6 accounts for a new tile against.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBudget {
    pub total_allocatable: u64,
    /// Kernel-globals struct + per-queue counters + queues-flag + two
    /// SoA shader-data headers.
    pub invariable: u64,
    /// Sum of texture sizes + `__data` constant buffer size.
    pub scene_specific: u64,
    /// Fixed slack spec.md calls `DATA_ALLOCATION_MEM_FACTOR`.
    pub data_allocation_mem_factor: u64,
    /// Per-thread cost: RNG + throughput + transparency + ray state +
    /// work element + lamp flag + path radiance + ray + path state + 3
    /// intersections + 3 shader-data records + light ray + BSDF eval + AO
    /// alpha/BSDF + one more ray + NUM_QUEUES ints + per-thread output
    /// buffer.
    pub per_thread_cost: u64,
}

/// `feasible_global_threads = (total_allocatable_memory - invariable - tile
/// - scene - DATA_ALLOCATION_MEM_FACTOR) / per_thread_cost`, where `tile`
/// is the memory a tile of `requested_area` pixels needs for its own
/// per-thread output buffer and RNG state (plus, with work-stealing, a
/// per-work-group pool -- folded into `tile_specific_per_pixel` by the
/// caller since whether work-stealing applies is a device property, not
/// a planner concern).
pub fn feasible_global_threads(
    budget: &MemoryBudget,
    tile_specific_per_pixel: u64,
    requested_area: u64,
) -> u64 {
    let tile_specific = tile_specific_per_pixel.saturating_mul(requested_area);
    let reserved = budget
        .invariable
        .saturating_add(tile_specific)
        .saturating_add(budget.scene_specific)
        .saturating_add(budget.data_allocation_mem_factor);
    let available = budget.total_allocatable.saturating_sub(reserved);
    if budget.per_thread_cost == 0 {
        return 0;
    }
    available / budget.per_thread_cost
}

/// The largest `(w, h)` with `w == h == floor(sqrt(n))`, each rounded to
/// a multiple of `(LX, LY)`, whose area still fits in `n` threads. Tries
/// the ceiling-rounded square first, falls back to the floor-rounded one.
pub fn max_feasible_tile(n: u64) -> (u32, u32) {
    if n == 0 {
        return (0, 0);
    }
    let side = (n as f64).sqrt() as u32;
    let ceil_w = ceil_multiple(side, LX);
    let ceil_h = ceil_multiple(side, LY);
    if (ceil_w as u64) * (ceil_h as u64) <= n {
        return (ceil_w, ceil_h);
    }
    let floor_w = floor_multiple(side, LX).max(LX);
    let floor_h = floor_multiple(side, LY).max(LY);
    (floor_w, floor_h)
}

/// True iff the ceiling-rounded requested tile area exceeds what the
/// device can feasibly run at once.
pub fn need_to_split_tile(w: u32, h: u32, feasible_threads: u64) -> bool {
    let area = ceil_multiple(w, LX) as u64 * ceil_multiple(h, LY) as u64;
    area > feasible_threads
}

/// Halve the larger dimension (re-rounded to the local multiple) until
/// the tile's area fits in `feasible_threads`. Starts from the
/// ceiling-rounded requested size.
pub fn split_tile_size(w: u32, h: u32, feasible_threads: u64) -> (u32, u32) {
    let mut sw = ceil_multiple(w, LX).max(LX);
    let mut sh = ceil_multiple(h, LY).max(LY);
    while (sw as u64) * (sh as u64) > feasible_threads {
        if sw >= sh {
            let halved = ceil_multiple((sw / 2).max(1), LX);
            if halved >= sw {
                break; // can't shrink further; avoid looping forever
            }
            sw = halved;
        } else {
            let halved = ceil_multiple((sh / 2).max(1), LY);
            if halved >= sh {
                break;
            }
            sh = halved;
        }
    }
    (sw, sh)
}

/// Subdivide `tile` into a grid of sub-tiles no larger than
/// `(split_w, split_h)`. Border sub-tiles absorb the residual width or
/// height. Every sub-tile carries a `buffer_offset`/`rng_state_offset`
/// into the parent tile's buffers so the whole grid shares one
/// accumulator.
pub fn subdivide_tile(tile: &RenderTile, split_w: u32, split_h: u32) -> Vec<RenderTile> {
    if split_w == 0 || split_h == 0 {
        return vec![*tile];
    }
    let cols = tile.w.div_ceil(split_w).max(1);
    let rows = tile.h.div_ceil(split_h).max(1);

    let mut out = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let off_x = col * split_w;
            let off_y = row * split_h;
            let w = split_w.min(tile.w - off_x);
            let h = split_h.min(tile.h - off_y);

            let mut sub = RenderTile::new(
                tile.x + off_x,
                tile.y + off_y,
                w,
                h,
                tile.start_sample,
                tile.num_samples,
            );
            sub.buffer = tile.buffer;
            sub.rng_state = tile.rng_state;
            sub.stride = tile.stride;
            sub.offset = tile.offset;
            sub.buffer_offset_x = tile.buffer_offset_x + off_x;
            sub.buffer_offset_y = tile.buffer_offset_y + off_y;
            sub.rng_state_offset_x = tile.rng_state_offset_x + off_x;
            sub.rng_state_offset_y = tile.rng_state_offset_y + off_y;
            sub.buffer_rng_state_stride = tile.stride;
            out.push(sub);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_multiple_basic() {
        assert_eq!(ceil_multiple(1, 64), 64);
        assert_eq!(ceil_multiple(64, 64), 64);
        assert_eq!(ceil_multiple(65, 64), 128);
        assert_eq!(ceil_multiple(0, 64), 0);
    }

    #[test]
    fn need_to_split_tile_boundary() {
        // 256x256 ceil-rounds to itself (already a multiple of 64x1);
        // area 65536 fits in exactly 65536 threads but not 65535.
        assert!(!need_to_split_tile(256, 256, 65536));
        assert!(need_to_split_tile(256, 256, 65535));
    }

    #[test]
    fn split_tile_size_is_multiple_of_local_size_and_fits() {
        let (w, h) = split_tile_size(1024, 1024, 200_000);
        assert_eq!(w % LX, 0);
        assert_eq!(h % LY, 0);
        assert!((w as u64) * (h as u64) <= 200_000);
    }

    #[test]
    fn subdivide_covers_parent_tile_exactly() {
        let tile = RenderTile::new(0, 0, 1024, 1024, 0, 4);
        let (split_w, split_h) = split_tile_size(1024, 1024, 200_000);
        let subs = subdivide_tile(&tile, split_w, split_h);

        let total_area: u64 = subs.iter().map(|t| t.area()).sum();
        assert_eq!(total_area, tile.area());

        // union of rectangles covers [0,1024)x[0,1024) exactly: check a
        // sampled grid of points are each covered by exactly one sub-tile.
        for px in (0..1024).step_by(37) {
            for py in (0..1024).step_by(41) {
                let covering = subs
                    .iter()
                    .filter(|t| {
                        px >= t.x && px < t.x + t.w && py >= t.y && py < t.y + t.h
                    })
                    .count();
                assert_eq!(covering, 1, "point ({px},{py}) covered {covering} times");
            }
        }
    }

    #[test]
    fn expected_number_of_subtiles_for_scenario_s4() {
        // S4: feasible_global_threads = 200000, tile 1024x1024.
        let feasible = 200_000u64;
        assert!(need_to_split_tile(1024, 1024, feasible));
        let (split_w, split_h) = split_tile_size(1024, 1024, feasible);
        let tile = RenderTile::new(0, 0, 1024, 1024, 0, 1);
        let subs = subdivide_tile(&tile, split_w, split_h);
        let expected = (1024u32.div_ceil(split_w)) * (1024u32.div_ceil(split_h));
        assert_eq!(subs.len() as u32, expected);
    }

    #[test]
    fn max_feasible_tile_is_multiple_of_local_size() {
        let (w, h) = max_feasible_tile(200_000);
        assert_eq!(w % LX, 0);
        assert_eq!(h % LY, 0);
        assert!((w as u64) * (h as u64) <= 200_000);
    }
}
