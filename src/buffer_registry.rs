//! Named device allocations for textures and constants, and the
//! positional argument binder every kernel dispatch goes through.
//! See spec.md §3 (`NamedMemory`) and §4.3 (argument binder).

use ocl::{Buffer, Context, Queue};
use std::collections::HashMap;

use crate::error::{DriverError, Result};
use crate::stats::Stats;

/// The full set of texture slots every kernel argument list reserves
/// room for, in the fixed order kernels expect them. This is the single
/// source of truth shared by `bind_textures` and (via `split_kernel`)
/// `SplitKernelArena`; kernel source on the other side of the FFI
/// boundary must agree with this ordering.
pub const TEXTURE_SLOTS: &[&str] = &[
    "__tex_image_diffuse",
    "__tex_image_normal",
    "__tex_image_roughness",
    "__tex_image_environment",
    "__tex_image_ies",
    "__tex_image_point_density",
];

/// Per-ray structure-of-arrays fields the split-kernel arena allocates
/// one contiguous buffer for, per spec.md §3.
pub const RAY_SOA_FIELDS: &[&str] = &[
    "P",
    "N",
    "Ng",
    "I",
    "shader",
    "flag",
    "prim",
    "type_",
    "u",
    "v",
    "object",
    "time",
    "ray_length",
    "ray_depth",
    "transparent_depth",
    "dP_dx",
    "dP_dy",
    "dI_dx",
    "dI_dy",
    "dP_du",
    "dP_dv",
    "closure",
    "num_closure",
    "randb_closure",
    "ray_P",
    "ray_D",
];

/// Access pattern a device allocation is created with, mirroring
/// spec.md §4.3's `mem_alloc(mem, kind)` contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemKind {
    fn flags(self) -> ocl::flags::MemFlags {
        match self {
            MemKind::ReadOnly => ocl::flags::MEM_READ_ONLY,
            MemKind::WriteOnly => ocl::flags::MEM_WRITE_ONLY,
            MemKind::ReadWrite => ocl::flags::MEM_READ_WRITE,
        }
    }
}

/// A named device-resident buffer. Opaque device pointer, byte size; the
/// only thing that changes between allocations is the wrapped `ocl`
/// buffer underneath.
pub struct MemObject {
    buffer: Buffer<u8>,
    size: u64,
}

impl MemObject {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn raw(&self) -> &Buffer<u8> {
        &self.buffer
    }

    /// An opaque identity usable for pointer-equality lookups (the "device
    /// pointer" spec.md refers to when it says textures are "freed
    /// explicitly by pointer lookup").
    pub fn identity(&self) -> u64 {
        self.buffer.as_core().as_ptr() as u64
    }

    /// `mem_copy_to`: blocking write from host memory to the device.
    pub fn copy_to(&self, queue: &Queue, data: &[u8]) -> Result<()> {
        write_blocking(queue, &self.buffer, data)
    }

    /// `mem_copy_from`: blocking read of a rectangular region back to
    /// the host. `row_bytes` is the width of one row in bytes.
    pub fn copy_from(&self, queue: &Queue, out: &mut [u8]) -> Result<()> {
        read_blocking(queue, &self.buffer, out)
    }

    /// `mem_zero`: zero host memory, then `mem_copy_to`.
    pub fn zero(&self, queue: &Queue) -> Result<()> {
        let zeros = vec![0u8; self.size as usize];
        self.copy_to(queue, &zeros)
    }

    /// `mem_free`: release the device allocation and account the freed
    /// bytes. Consumes `self` so the caller cannot keep using a freed
    /// handle; "zero the pointer" from spec.md is enforced at the type
    /// level instead of at runtime.
    pub fn free(self, stats: &Stats) {
        stats.mem_free(self.size);
        // `self.buffer` drops here, releasing the underlying cl_mem.
    }
}

struct ConstantEntry {
    host: Vec<u8>,
    device: MemObject,
}

/// `NamedMemory`: `{name -> device_pointer}` for textures,
/// `{name -> device_vector}` for constants.
pub struct BufferRegistry {
    textures: HashMap<String, MemObject>,
    constants: HashMap<String, ConstantEntry>,
    /// 1-byte buffer bound in place of any texture slot with no uploaded
    /// texture: the runtime rejects a literal null argument.
    null_sentinel: MemObject,
    /// General-purpose allocations from `DeviceBase::mem_alloc`, looked
    /// up by `MemObject::identity()` when a `RenderTile`'s opaque
    /// `buffer`/`rng_state` pointer needs to be bound as a kernel
    /// argument. A clone of the underlying `ocl` buffer (a cheap
    /// refcount bump, not a device-memory copy) lives here alongside the
    /// caller's owned `MemObject`.
    general: HashMap<u64, Buffer<u8>>,
}

impl BufferRegistry {
    pub fn new(context: &Context, queue: &Queue, stats: &Stats) -> Result<Self> {
        let null_sentinel = alloc_ro(context, queue, 1, stats)?;
        Ok(Self {
            textures: HashMap::new(),
            constants: HashMap::new(),
            null_sentinel,
            general: HashMap::new(),
        })
    }

    pub fn register_general(&mut self, mem: &MemObject) {
        self.general.insert(mem.identity(), mem.buffer.clone());
    }

    pub fn unregister_general(&mut self, ptr: u64) {
        self.general.remove(&ptr);
    }

    /// Look up a previously `mem_alloc`'d buffer by its opaque identity,
    /// as carried around in `RenderTile::buffer` / `RenderTile::rng_state`.
    pub fn buffer_by_ptr(&self, ptr: u64) -> Option<&Buffer<u8>> {
        self.general.get(&ptr)
    }

    /// RO allocation + upload + register in the texture map. Re-running
    /// with the same `name` replaces the previous entry (the caller is
    /// expected to have freed it first via `tex_free` if that matters for
    /// accounting).
    pub fn tex_alloc(
        &mut self,
        context: &Context,
        queue: &Queue,
        stats: &Stats,
        name: &str,
        data: &[u8],
    ) -> Result<()> {
        let mem = alloc_ro(context, queue, data.len() as u64, stats)?;
        write_blocking(queue, mem.raw(), data)?;
        self.textures.insert(name.to_string(), mem);
        Ok(())
    }

    /// Linear search of the texture map by device pointer, as spec.md
    /// §4.3 specifies, then free.
    pub fn tex_free(&mut self, stats: &Stats, ptr: u64) {
        let name = self
            .textures
            .iter()
            .find(|(_, mem)| mem.identity() == ptr)
            .map(|(name, _)| name.clone());
        if let Some(name) = name {
            if let Some(mem) = self.textures.remove(&name) {
                stats.mem_free(mem.size());
            }
        }
    }

    /// First call allocates a RO buffer and inserts it; subsequent calls
    /// refresh the host copy and re-upload rather than reallocating.
    pub fn const_copy_to(
        &mut self,
        context: &Context,
        queue: &Queue,
        stats: &Stats,
        name: &str,
        host: &[u8],
    ) -> Result<()> {
        if let Some(entry) = self.constants.get_mut(name) {
            entry.host.clear();
            entry.host.extend_from_slice(host);
            write_blocking(queue, entry.device.raw(), &entry.host)?;
            return Ok(());
        }
        let mem = alloc_ro(context, queue, host.len() as u64, stats)?;
        write_blocking(queue, mem.raw(), host)?;
        self.constants.insert(
            name.to_string(),
            ConstantEntry {
                host: host.to_vec(),
                device: mem,
            },
        );
        Ok(())
    }

    pub fn constant(&self, name: &str) -> Option<&Buffer<u8>> {
        self.constants.get(name).map(|e| e.device.raw())
    }

    pub fn texture(&self, name: &str) -> Option<&Buffer<u8>> {
        self.textures.get(name).map(|m| m.raw())
    }

    /// Placeholder buffer bound to a memory-typed kernel argument before
    /// any real value exists for it, so the argument is always declared
    /// at kernel-build time (`ocl` rejects `set_arg_named` on a name that
    /// was never passed to `arg_named`).
    pub fn null_sentinel(&self) -> &Buffer<u8> {
        &self.null_sentinel.buffer
    }

    /// Bind every name in `TEXTURE_SLOTS` in order: the texture's device
    /// pointer if uploaded, the null sentinel otherwise.
    pub fn bind_textures(&self) -> Vec<&Buffer<u8>> {
        TEXTURE_SLOTS
            .iter()
            .map(|name| self.texture(name).unwrap_or(&self.null_sentinel.buffer))
            .collect()
    }

    /// `"__data"` must be populated (see spec.md §3 invariant) before any
    /// kernel dispatch; callers check this rather than dispatching blind.
    pub fn has_data_constant(&self) -> bool {
        self.constants.contains_key("__data")
    }
}

fn alloc_ro(context: &Context, queue: &Queue, size: u64, stats: &Stats) -> Result<MemObject> {
    alloc_buffer(context, queue, size, MemKind::ReadOnly, stats)
}

/// Create a device buffer of the given size and access kind, and account
/// for it in `stats`. Shared by `BufferRegistry`'s texture/constant
/// allocations and `DeviceBase`'s general-purpose `mem_alloc`.
pub fn alloc_buffer(
    context: &Context,
    queue: &Queue,
    size: u64,
    kind: MemKind,
    stats: &Stats,
) -> Result<MemObject> {
    let buffer = Buffer::<u8>::builder()
        .queue(queue.clone())
        .context(context)
        .flags(kind.flags())
        .len(size.max(1) as usize)
        .build()
        .map_err(|e| DriverError::BufferAllocation {
            bytes: size,
            source: e.to_string(),
        })?;
    stats.mem_alloc(size);
    Ok(MemObject { buffer, size })
}

pub(crate) fn write_blocking(queue: &Queue, buffer: &Buffer<u8>, data: &[u8]) -> Result<()> {
    buffer
        .write(data)
        .queue(queue)
        .enq()
        .map_err(|e| DriverError::MemoryTransfer(e.to_string()))
}

pub(crate) fn read_blocking(queue: &Queue, buffer: &Buffer<u8>, out: &mut [u8]) -> Result<()> {
    buffer
        .read(out)
        .queue(queue)
        .enq()
        .map_err(|e| DriverError::ReadbackFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_slots_and_soa_fields_are_non_empty_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for name in TEXTURE_SLOTS {
            assert!(seen.insert(*name), "duplicate texture slot {name}");
        }
        seen.clear();
        for name in RAY_SOA_FIELDS {
            assert!(seen.insert(*name), "duplicate SoA field {name}");
        }
    }
}
