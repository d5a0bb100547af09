//! Persistent kernel compilation cache
//!
//! Content-addressed: the key is the hash of the compile-parameter string
//! joined with the hash of the kernel source text. Entries are immutable
//! once written; a new parameter/source combination always produces a new
//! entry. The persistent store survives process restarts and is namespaced
//! by product version and device name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::device::{Device, ProgramBlob};
use crate::error::{RenderError, RenderResult};

/// Result of a cache-mediated compile.
pub struct CachedProgram {
    pub blob: ProgramBlob,
    /// Diagnostic: true when the blob came from the cache.
    pub cached: bool,
}

/// Key → compiled-program store fronting the device compiler.
pub trait KernelCache: Send + Sync {
    fn compile(&self, device: &dyn Device, params: &str, source: &str)
        -> RenderResult<CachedProgram>;
}

/// Short content hash of a string, stable across runs.
pub fn hash_string(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        use std::fmt::Write;
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

/// The cache key: parameter hash and source hash joined with a separator.
pub fn cache_key(params: &str, source: &str) -> String {
    format!("{}-{}", hash_string(params), hash_string(source))
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

//------------------------------------------------------------------------------
// Persistent cache
//------------------------------------------------------------------------------

/// File-system backed cache, one blob file per key.
///
/// Each file carries an integrity hash ahead of the blob; a corrupted file
/// is removed and the entry recompiled.
pub struct PersistentKernelCache {
    app_name: String,
    root: PathBuf,
}

impl PersistentKernelCache {
    /// `app_name` namespaces the store, typically product name + version.
    pub fn new(app_name: &str, root: Option<PathBuf>) -> RenderResult<Self> {
        let root = root.unwrap_or_else(|| std::env::temp_dir().join("trace3d"));
        let cache = PersistentKernelCache {
            app_name: app_name.to_string(),
            root,
        };
        std::fs::create_dir_all(cache.cache_dir())?;
        Ok(cache)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root
            .join("kernel_cache")
            .join(sanitize_file_name(&self.app_name))
    }

    fn entry_path(&self, device_name: &str, key: &str) -> PathBuf {
        self.cache_dir()
            .join(sanitize_file_name(device_name))
            .join(format!("{key}.bin"))
    }

    fn read_entry(path: &Path) -> Option<Vec<u8>> {
        let bytes = std::fs::read(path).ok()?;
        if bytes.len() < 32 {
            return None;
        }
        let (stored_hash, blob) = bytes.split_at(32);
        let digest = Sha256::digest(blob);
        if stored_hash == digest.as_slice() {
            Some(blob.to_vec())
        } else {
            None
        }
    }

    fn write_entry(path: &Path, blob: &[u8]) -> RenderResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let digest = Sha256::digest(blob);
        let mut bytes = Vec::with_capacity(32 + blob.len());
        bytes.extend_from_slice(&digest);
        bytes.extend_from_slice(blob);
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Record the keys a successful engine start compiled against.
    ///
    /// Written only after every device thread compiled, so a partially
    /// failed start never marks its kernel combination as known good.
    pub fn write_known_good_marker(&self, keys: &[String]) -> RenderResult<()> {
        let path = self.cache_dir().join("known_good.json");
        let json = serde_json::to_string_pretty(keys)
            .map_err(|e| RenderError::device(format!("marker serialization failed: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_known_good_marker(&self) -> Vec<String> {
        let path = self.cache_dir().join("known_good.json");
        std::fs::read_to_string(path)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }
}

impl KernelCache for PersistentKernelCache {
    fn compile(
        &self,
        device: &dyn Device,
        params: &str,
        source: &str,
    ) -> RenderResult<CachedProgram> {
        let key = cache_key(params, source);
        let path = self.entry_path(device.name(), &key);

        if path.exists() {
            match Self::read_entry(&path) {
                Some(data) => {
                    return Ok(CachedProgram {
                        blob: ProgramBlob { data },
                        cached: true,
                    });
                }
                None => {
                    // Corrupted entry: remove and fall through to recompile
                    log::warn!("Removing corrupted kernel cache entry {}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        let blob = device.compile_program(params, source)?;
        if !blob.data.is_empty() {
            Self::write_entry(&path, &blob.data)?;
        }
        Ok(CachedProgram {
            blob,
            cached: false,
        })
    }
}

//------------------------------------------------------------------------------
// Volatile cache
//------------------------------------------------------------------------------

/// In-memory cache; lives as long as the process.
#[derive(Default)]
pub struct VolatileKernelCache {
    entries: Mutex<HashMap<String, ProgramBlob>>,
}

impl VolatileKernelCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KernelCache for VolatileKernelCache {
    fn compile(
        &self,
        device: &dyn Device,
        params: &str,
        source: &str,
    ) -> RenderResult<CachedProgram> {
        let key = cache_key(params, source);
        if let Some(blob) = self.entries.lock().unwrap().get(&key) {
            return Ok(CachedProgram {
                blob: blob.clone(),
                cached: true,
            });
        }
        let blob = device.compile_program(params, source)?;
        self.entries
            .lock()
            .unwrap()
            .insert(key, blob.clone());
        Ok(CachedProgram {
            blob,
            cached: false,
        })
    }
}

//------------------------------------------------------------------------------
// No cache
//------------------------------------------------------------------------------

/// Pass-through: every compile goes to the device compiler.
pub struct NoKernelCache;

impl KernelCache for NoKernelCache {
    fn compile(
        &self,
        device: &dyn Device,
        params: &str,
        source: &str,
    ) -> RenderResult<CachedProgram> {
        let blob = device.compile_program(params, source)?;
        Ok(CachedProgram {
            blob,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_content_addressed() {
        let a = cache_key("-D A", "fn main() {}");
        let b = cache_key("-D A", "fn main() {}");
        assert_eq!(a, b);
        assert_ne!(a, cache_key("-D B", "fn main() {}"));
        assert_ne!(a, cache_key("-D A", "fn other() {}"));
        // hash(params) "-" hash(source)
        assert_eq!(a.len(), 16 + 1 + 16);
        assert_eq!(a.split('-').count(), 2);
    }

    #[test]
    fn entry_round_trips_with_integrity_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.bin");
        PersistentKernelCache::write_entry(&path, b"blob-bytes").unwrap();
        assert_eq!(
            PersistentKernelCache::read_entry(&path).unwrap(),
            b"blob-bytes"
        );
    }

    #[test]
    fn corrupted_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.bin");
        PersistentKernelCache::write_entry(&path, b"blob-bytes").unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(PersistentKernelCache::read_entry(&path).is_none());
    }

    #[test]
    fn known_good_marker_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentKernelCache::new("test", Some(dir.path().to_path_buf())).unwrap();
        let keys = vec![cache_key("-D A", "src")];
        cache.write_known_good_marker(&keys).unwrap();
        assert_eq!(cache.read_known_good_marker(), keys);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("NVIDIA GeForce"), "NVIDIA_GeForce");
        assert_eq!(sanitize_file_name("cpu:0"), "cpu_0");
    }
}
