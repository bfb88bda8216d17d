//! Disk-backed cache of compiled program binaries, keyed by a fingerprint
//! of device identity and kernel source. See spec.md §4.2.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DriverError, Result};

/// Everything that participates in the device half of the fingerprint.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub vendor: String,
    pub version: String,
    pub name: String,
    pub driver: String,
    pub build_options: String,
}

fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]); // separator, avoids "ab"+"c" == "a"+"bc" collisions
    }
    let out = hasher.finalize();
    // Sixteen hex chars is plenty of entropy for a cache filename and
    // keeps names from becoming unwieldy.
    out.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

pub fn device_fingerprint(identity: &DeviceIdentity) -> String {
    digest_hex(&[
        &identity.vendor,
        &identity.version,
        &identity.name,
        &identity.driver,
        &identity.build_options,
    ])
}

pub fn source_fingerprint(sources: &[&str]) -> String {
    digest_hex(sources)
}

/// Disk-backed compiled-binary cache under `cache_dir`.
pub struct BinaryCache {
    cache_dir: PathBuf,
}

impl BinaryCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// `cycles_kernel_<device_fingerprint>_<source_fingerprint>[_<variant>].bin`
    pub fn file_name(
        &self,
        device_fp: &str,
        source_fp: &str,
        variant: Option<&str>,
    ) -> PathBuf {
        let name = match variant {
            Some(v) => format!("cycles_kernel_{device_fp}_{source_fp}_{v}.bin"),
            None => format!("cycles_kernel_{device_fp}_{source_fp}.bin"),
        };
        self.cache_dir.join(name)
    }

    /// Read a cached binary for this key, if present. Returns `Ok(None)`
    /// on a simple cache miss; corrupt files are treated the same way
    /// (logged, not propagated as an error) because the caller's fallback
    /// is always "compile from source."
    pub fn load(
        &self,
        device_fp: &str,
        source_fp: &str,
        variant: Option<&str>,
    ) -> Option<Vec<u8>> {
        let path = self.file_name(device_fp, source_fp, variant);
        match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => {
                log::warn!("binary cache file {path:?} is empty, treating as a miss");
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("binary cache file {path:?} unreadable ({e}), treating as a miss");
                None
            }
        }
    }

    /// Write a freshly compiled binary to the cache. Save failures are
    /// fatal (propagated, not logged-and-ignored): an uncached expensive
    /// compile would otherwise repeat on every launch.
    pub fn store(
        &self,
        device_fp: &str,
        source_fp: &str,
        variant: Option<&str>,
        binary: &[u8],
    ) -> Result<()> {
        let path = self.file_name(device_fp, source_fp, variant);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DriverError::BinarySaveFailed {
                path: path.clone(),
                source: source.to_string(),
            })?;
        }
        fs::write(&path, binary).map_err(|source| DriverError::BinarySaveFailed {
            path,
            source: source.to_string(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(build_options: &str) -> DeviceIdentity {
        DeviceIdentity {
            vendor: "Acme".into(),
            version: "OpenCL 1.2".into(),
            name: "Acme GPU 9000".into(),
            driver: "1.0.0".into(),
            build_options: build_options.into(),
        }
    }

    #[test]
    fn identical_inputs_produce_identical_filenames() {
        let a = device_fingerprint(&identity("-cl-fast-relaxed-math"));
        let b = device_fingerprint(&identity("-cl-fast-relaxed-math"));
        assert_eq!(a, b);
    }

    #[test]
    fn changing_build_options_changes_fingerprint() {
        let a = device_fingerprint(&identity("-cl-fast-relaxed-math"));
        let b = device_fingerprint(&identity("-cl-fast-relaxed-math -g"));
        assert_ne!(a, b);
    }

    #[test]
    fn changing_device_identity_changes_fingerprint() {
        let mut other = identity("-cl-fast-relaxed-math");
        other.name = "Different GPU".into();
        let a = device_fingerprint(&identity("-cl-fast-relaxed-math"));
        let b = device_fingerprint(&other);
        assert_ne!(a, b);
    }

    #[test]
    fn changing_source_changes_fingerprint() {
        let a = source_fingerprint(&["kernel void foo() {}"]);
        let b = source_fingerprint(&["kernel void bar() {}"]);
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("pathtrace-device-test-{}", std::process::id()));
        let cache = BinaryCache::new(dir.clone());
        let device_fp = device_fingerprint(&identity("-O2"));
        let source_fp = source_fingerprint(&["kernel void foo() {}"]);

        assert!(cache.load(&device_fp, &source_fp, None).is_none());
        cache
            .store(&device_fp, &source_fp, None, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(
            cache.load(&device_fp, &source_fp, None),
            Some(vec![1, 2, 3, 4])
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_empty_file_is_treated_as_a_miss() {
        let dir = std::env::temp_dir().join(format!("pathtrace-device-test-corrupt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let cache = BinaryCache::new(dir.clone());
        let device_fp = device_fingerprint(&identity("-O2"));
        let source_fp = source_fingerprint(&["kernel void foo() {}"]);
        let path = cache.file_name(&device_fp, &source_fp, None);
        fs::write(&path, []).unwrap();

        assert!(cache.load(&device_fp, &source_fp, None).is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
