//! Device selection, context/queue setup, build-flag computation, memory
//! operations, and kernel dispatch geometry shared by both strategies.
//! See spec.md §4.3.

use ocl::{Context, Device, Kernel, Platform, Program, Queue};

use crate::binary_cache::{device_fingerprint, source_fingerprint, BinaryCache, DeviceIdentity};
use crate::buffer_registry::{self, BufferRegistry, MemKind, MemObject};
use crate::config::Config;
use crate::error::{DriverError, ErrorSink, Result};
use crate::program_cache::{self, SharedContext, SharedProgram, SlotKey};
use crate::stats::Stats;
use crate::tile::DeviceInfo;

/// Minimum OpenCL platform and C versions this driver requires.
const MIN_VERSION: (u32, u32) = (1, 1);

/// Parse a `"OpenCL %d.%d"` / `"OpenCL C %d.%d"`-shaped version string.
/// Returns `None` on any deviation from that shape; the caller turns that
/// into `DriverError::VersionTooLow`, never a panic — malformed version
/// strings are something real drivers actually produce.
pub fn parse_version(s: &str, prefix: &str) -> Option<(u32, u32)> {
    let rest = s.strip_prefix(prefix)?.trim();
    let rest = rest.split_whitespace().next()?; // ignore vendor suffix text
    let mut parts = rest.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn version_ok(found: (u32, u32), required: (u32, u32)) -> bool {
    found.0 > required.0 || (found.0 == required.0 && found.1 >= required.1)
}

/// Build-option defines selected from the platform vendor string, plus
/// the common `-cl-fast-relaxed-math` and (if `CYCLES_OPENCL_DEBUG` is
/// set) source-debugging flags.
pub fn build_flags_for_vendor(vendor: &str, debug: bool) -> String {
    let mut flags = Vec::new();
    let lower = vendor.to_ascii_lowercase();
    if lower.contains("nvidia") {
        flags.push("-D__KERNEL_OPENCL_NVIDIA__".to_string());
        flags.push("-cl-nv-maxrregcount=32".to_string());
        flags.push("-cl-nv-verbose".to_string());
    } else if lower.contains("apple") {
        flags.push("-D__KERNEL_OPENCL_APPLE__".to_string());
    } else if lower.contains("amd") || lower.contains("advanced micro devices") {
        flags.push("-D__KERNEL_OPENCL_AMD__".to_string());
    } else if lower.contains("intel") {
        flags.push("-D__KERNEL_OPENCL_INTEL_CPU__".to_string());
    }
    flags.push("-cl-fast-relaxed-math".to_string());
    if debug {
        flags.push("-g".to_string());
        flags.push("-s".to_string());
        flags.push("-D__KERNEL_OPENCL_DEBUG__".to_string());
    }
    flags.join(" ")
}

pub fn is_amd_gpu(vendor: &str, is_gpu: bool) -> bool {
    is_gpu && vendor.to_ascii_lowercase().contains("amd")
}

/// Select a platform/device pair by a flat index across all platforms'
/// devices, as spec.md §4.3 specifies: iterate platforms, decrementing
/// the remaining index by each platform's device count, stop on match.
///
/// The comparison against each platform's device count is deliberately
/// signed (`num` is `i64`), matching a quirk in the source this is
/// ported from (spec.md §9): replicate the exact semantics rather than
/// silently switching to an unsigned comparison.
pub fn select_platform_device(num: i64) -> Result<(Platform, Device)> {
    let platforms = Platform::list();
    let mut remaining = num;
    for platform in platforms {
        let devices = Device::list_all(platform)
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?;
        let count = devices.len() as i64;
        if remaining < count {
            if remaining < 0 {
                return Err(DriverError::NoDevicesFound);
            }
            return Ok((platform, devices[remaining as usize]));
        }
        remaining -= count;
    }
    Err(DriverError::NoDevicesFound)
}

/// `local = (floor(sqrt(wg)), floor(sqrt(wg)))`, clamped to the second
/// dimension's device maximum with the first dimension rescaled to
/// preserve the product; `global` is each requested dimension rounded up
/// to a multiple of the matching local dimension.
pub fn dispatch_geometry(
    max_work_group_size: usize,
    max_work_item_sizes: [usize; 2],
    required: [usize; 2],
) -> ([usize; 2], [usize; 2]) {
    let side = (max_work_group_size as f64).sqrt() as usize;
    let mut local = [side.max(1), side.max(1)];
    if local[1] > max_work_item_sizes[1] {
        local[1] = max_work_item_sizes[1].max(1);
        local[0] = (max_work_group_size / local[1]).max(1);
    }
    let global = [
        required[0].div_ceil(local[0].max(1)) * local[0].max(1),
        required[1].div_ceil(local[1].max(1)) * local[1].max(1),
    ];
    (local, global)
}

/// Everything a dispatch strategy needs: the context, queue, compiled
/// programs, the buffer registry, and the bookkeeping objects every
/// operation accounts against.
pub struct DeviceBase {
    pub info: DeviceInfo,
    pub config: Config,
    platform: Platform,
    device: Device,
    context: SharedContext,
    queue: Queue,
    pub registry: BufferRegistry,
    pub stats: Stats,
    pub errors: ErrorSink,
    build_options: String,
    vendor: String,
    device_name: String,
    device_version: String,
    driver_version: String,
    pub binary_cache: BinaryCache,
}

impl DeviceBase {
    pub fn new(info: DeviceInfo, config: Config) -> Result<Self> {
        let (platform, device) = select_platform_device(info.num)?;
        let vendor = platform
            .name()
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?;

        let platform_version = platform
            .version()
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?
            .to_string();
        let parsed = parse_version(&platform_version, "OpenCL").ok_or_else(|| {
            DriverError::VersionTooLow {
                found: (0, 0),
                required: MIN_VERSION,
            }
        })?;
        if !version_ok(parsed, MIN_VERSION) {
            return Err(DriverError::VersionTooLow {
                found: parsed,
                required: MIN_VERSION,
            });
        }

        let build_options = build_flags_for_vendor(&vendor, config.debug);

        let device_name = device
            .name()
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?;
        let device_version = device
            .version()
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?
            .to_string();
        let driver_version = device
            .driver_version()
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?;

        let key: SlotKey = (platform.as_core().as_ptr() as i64, device.as_core().as_ptr() as i64);
        let context = program_cache::global().get_or_create_context(key, || {
            Context::builder()
                .platform(platform)
                .devices(device)
                .build()
                .map_err(|e| DriverError::ContextCreation(e.to_string()))
        })?;

        let queue = Queue::new(&context.0, device, None)
            .map_err(|e| DriverError::ContextCreation(e.to_string()))?;

        let stats = Stats::new();
        let registry = BufferRegistry::new(&context.0, &queue, &stats)?;
        let binary_cache = BinaryCache::new(config.cache_dir.clone());

        Ok(Self {
            info,
            config,
            platform,
            device,
            context,
            queue,
            registry,
            stats,
            errors: ErrorSink::new(),
            build_options,
            vendor,
            device_name,
            device_version,
            driver_version,
            binary_cache,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context.0
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn build_options(&self) -> &str {
        &self.build_options
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn slot_key(&self) -> SlotKey {
        (
            self.platform.as_core().as_ptr() as i64,
            self.device.as_core().as_ptr() as i64,
        )
    }

    fn identity(&self, options: &str) -> DeviceIdentity {
        DeviceIdentity {
            vendor: self.vendor.clone(),
            version: self.device_version.clone(),
            name: self.device_name.clone(),
            driver: self.driver_version.clone(),
            build_options: options.to_string(),
        }
    }

    /// Fetch a named program from the process-wide cache, compiling (or
    /// loading from the on-disk binary cache) via `produce` if absent.
    /// `extra_build_options` is appended to this device's base build
    /// options and participates in both the in-process cache key (via
    /// `name`) and the on-disk fingerprint.
    ///
    /// Tries the disk cache first; on a hit, builds the `Program` from
    /// the cached binary instead of recompiling from source. On a miss
    /// (or a binary that the driver now rejects, e.g. after a driver
    /// upgrade), compiles from source and writes the binary back.
    pub fn load_program(&self, name: &str, source: &str, extra_build_options: &str) -> Result<SharedProgram> {
        let options = format!("{} {}", self.build_options, extra_build_options);
        let identity = self.identity(&options);
        let device_fp = device_fingerprint(&identity);
        let source_fp = source_fingerprint(&[source]);

        program_cache::global().get_or_create_program(self.slot_key(), name, || {
            if let Some(binary) = self.binary_cache.load(&device_fp, &source_fp, None) {
                match Program::builder()
                    .devices(self.device)
                    .bins(vec![binary.as_slice()])
                    .build(&self.context.0)
                {
                    Ok(program) => return Ok(program),
                    Err(e) => log::warn!(
                        "cached binary for '{name}' rejected by the driver ({e}), recompiling"
                    ),
                }
            }

            let program = Program::builder()
                .devices(self.device)
                .src(source)
                .cmplr_opt(options.clone())
                .build(&self.context.0)
                .map_err(|e| program_cache::map_build_error(name, e))?;

            match program.info(ocl::enums::ProgramInfo::Binaries) {
                Ok(ocl::enums::ProgramInfoResult::Binaries(binaries)) => {
                    if let Some(binary) = binaries.into_iter().next() {
                        if let Err(e) = self.binary_cache.store(&device_fp, &source_fp, None, &binary) {
                            return Err(e);
                        }
                    }
                }
                _ => log::warn!("could not extract compiled binary for '{name}', not caching to disk"),
            }

            Ok(program)
        })
    }

    pub fn kernel_builder<'p>(&self, program: &'p Program, name: &str) -> ocl::builders::KernelBuilder<'p> {
        let mut builder = Kernel::builder();
        builder.program(program).name(name).queue(self.queue.clone());
        builder
    }

    /// Query this kernel's work-group size and the device's max
    /// work-item sizes, then derive `(local, global)` for `required` via
    /// [`dispatch_geometry`]. Every strategy goes through this rather
    /// than hand-rolling the query, so the two geometry selections never
    /// drift apart.
    pub fn geometry_for(&self, kernel: &Kernel, required: [usize; 2]) -> Result<([usize; 2], [usize; 2])> {
        let wg_size = match kernel
            .wg_info(self.device, ocl::enums::KernelWorkGroupInfo::WorkGroupSize)
            .map_err(|e| DriverError::KernelLaunch {
                kernel: kernel.name().unwrap_or_default(),
                source: e.to_string(),
            })? {
            ocl::enums::KernelWorkGroupInfoResult::WorkGroupSize(n) => n,
            _ => 1,
        };
        let max_items = match self
            .device
            .info(ocl::enums::DeviceInfo::MaxWorkItemSizes)
            .map_err(|e| DriverError::PlatformDiscovery(e.to_string()))?
        {
            ocl::enums::DeviceInfoResult::MaxWorkItemSizes(sizes) => {
                [sizes.first().copied().unwrap_or(1), sizes.get(1).copied().unwrap_or(1)]
            }
            _ => [1, 1],
        };
        Ok(dispatch_geometry(wg_size, max_items, required))
    }

    // ---- memory operations (spec.md §4.3) ----

    pub fn mem_alloc(&mut self, size: u64, kind: MemKind) -> Result<MemObject> {
        let mem = buffer_registry::alloc_buffer(&self.context.0, &self.queue, size, kind, &self.stats)?;
        self.registry.register_general(&mem);
        Ok(mem)
    }

    /// Look up a general allocation by the opaque identity a `RenderTile`
    /// carries in `buffer`/`rng_state`, for binding as a kernel argument.
    pub fn buffer_by_ptr(&self, ptr: u64) -> Option<&ocl::Buffer<u8>> {
        self.registry.buffer_by_ptr(ptr)
    }

    pub fn mem_copy_to(&self, mem: &MemObject, data: &[u8]) -> Result<()> {
        mem.copy_to(&self.queue, data)
    }

    pub fn mem_copy_from(&self, mem: &MemObject, out: &mut [u8]) -> Result<()> {
        mem.copy_from(&self.queue, out)
    }

    pub fn mem_zero(&self, mem: &MemObject) -> Result<()> {
        mem.zero(&self.queue)
    }

    pub fn mem_free(&mut self, mem: MemObject) {
        self.registry.unregister_general(mem.identity());
        mem.free(&self.stats);
    }

    pub fn const_copy_to(&mut self, name: &str, host: &[u8]) -> Result<()> {
        self.registry
            .const_copy_to(&self.context.0, &self.queue, &self.stats, name, host)
    }

    pub fn tex_alloc(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.registry
            .tex_alloc(&self.context.0, &self.queue, &self.stats, name, data)
    }

    pub fn tex_free(&mut self, ptr: u64) {
        self.registry.tex_free(&self.stats, ptr);
    }

    pub fn finish(&self) -> Result<()> {
        self.queue
            .finish()
            .map_err(|e| DriverError::MemoryTransfer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_version_strings() {
        assert_eq!(parse_version("OpenCL 1.2 NVIDIA CUDA", "OpenCL"), Some((1, 2)));
        assert_eq!(parse_version("OpenCL C 2.0", "OpenCL C"), Some((2, 0)));
    }

    #[test]
    fn rejects_malformed_version_strings() {
        assert_eq!(parse_version("garbage", "OpenCL"), None);
        assert_eq!(parse_version("OpenCL", "OpenCL"), None);
    }

    #[test]
    fn version_ok_boundary() {
        assert!(version_ok((1, 1), (1, 1)));
        assert!(version_ok((1, 2), (1, 1)));
        assert!(version_ok((2, 0), (1, 1)));
        assert!(!version_ok((1, 0), (1, 1)));
        assert!(!version_ok((0, 9), (1, 1)));
    }

    #[test]
    fn vendor_build_flags_select_expected_defines() {
        assert!(build_flags_for_vendor("NVIDIA CUDA", false).contains("__KERNEL_OPENCL_NVIDIA__"));
        assert!(build_flags_for_vendor("Apple", false).contains("__KERNEL_OPENCL_APPLE__"));
        assert!(build_flags_for_vendor("Advanced Micro Devices, Inc.", false)
            .contains("__KERNEL_OPENCL_AMD__"));
        assert!(build_flags_for_vendor("Intel(R) Corporation", false)
            .contains("__KERNEL_OPENCL_INTEL_CPU__"));
        assert!(build_flags_for_vendor("Acme", false).contains("-cl-fast-relaxed-math"));
    }

    #[test]
    fn debug_flag_adds_source_debugging_options() {
        let flags = build_flags_for_vendor("Acme", true);
        assert!(flags.contains("-g"));
        assert!(flags.contains("__KERNEL_OPENCL_DEBUG__"));
    }

    #[test]
    fn is_amd_gpu_requires_both_vendor_and_kind() {
        assert!(is_amd_gpu("Advanced Micro Devices, Inc.", true));
        assert!(!is_amd_gpu("Advanced Micro Devices, Inc.", false));
        assert!(!is_amd_gpu("NVIDIA", true));
    }

    #[test]
    fn dispatch_geometry_rounds_up_to_local_multiple() {
        let (local, global) = dispatch_geometry(256, [256, 256], [100, 100]);
        assert_eq!(global[0] % local[0], 0);
        assert_eq!(global[1] % local[1], 0);
        assert!(global[0] >= 100 && global[1] >= 100);
    }

    #[test]
    fn dispatch_geometry_clamps_to_max_work_item_size() {
        // sqrt(1024) = 32, but the device only allows 8 in dim 1.
        let (local, _global) = dispatch_geometry(1024, [1024, 8], [64, 64]);
        assert!(local[1] <= 8);
    }
}
