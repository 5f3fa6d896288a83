//! storage driver backends owning on-disk layout, mounts and diffs
//!
//! drivers conform to one contract: create layer directories, mount and
//! unmount them with reference counting, apply tar deltas and produce
//! them back out. two overlay implementations exist; the legacy-capable
//! `overlay` driver and the multi-lower-only `overlay2` driver.

mod copy;
mod counter;
mod kernel;
pub(crate) mod mount;
mod naive;
mod overlay;
mod overlay2;

pub use copy::{copy_dir, CopyFlags};
pub use counter::RefCounter;
pub use kernel::{get_kernel_version, KernelVersion};
pub use mount::{format_mount_label, page_size};
pub use overlay::OverlayDriver;
pub use overlay2::Overlay2Driver;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::archive::Change;
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};

/// the storage backend contract
///
/// ids are caller-chosen opaque strings; a parent of `None` denotes a
/// base layer.
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// create a read-only layer directory
    fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
        storage_opt: &HashMap<String, String>,
    ) -> Result<()>;

    /// create a layer that will be written to; defaults to `create`
    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
        storage_opt: &HashMap<String, String>,
    ) -> Result<()> {
        self.create(id, parent, mount_label, storage_opt)
    }

    /// recursively delete the layer directory
    fn remove(&self, id: &str) -> Result<()>;

    /// mount (idempotently) and return the usable filesystem path
    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    /// drop one mount reference, unmounting at zero
    fn put(&self, id: &str) -> Result<()>;

    fn exists(&self, id: &str) -> bool;

    fn metadata(&self, id: &str) -> Result<HashMap<String, String>>;

    fn status(&self) -> Vec<(String, String)>;

    /// apply an uncompressed tar delta, returning the new diff size
    fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<u64>;

    /// produce the layer's delta as an uncompressed tar
    fn diff(&self, id: &str, parent: Option<&str>) -> Result<Box<dyn Read + Send>>;

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64>;

    fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>>;

    /// release anything held at daemon shutdown
    fn cleanup(&self) -> Result<()>;
}

/// constructor signature for registered drivers
pub type DriverFactory = fn(home: &Path, options: &[String]) -> Result<Box<dyn Driver>>;

/// explicit name-to-factory registry, populated once at startup and
/// passed into store construction
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// registry with the built-in backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("overlay", |home, options| {
            Ok(Box::new(OverlayDriver::new(home, options)?))
        });
        registry.register("overlay2", |home, options| {
            Ok(Box::new(Overlay2Driver::new(home, options)?))
        });
        registry.register("snapshot-overlay", |_home, _options| {
            Err(Error::Unsupported("snapshot-overlay driver"))
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str, home: &Path, options: &[String]) -> Result<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownDriver(name.to_string()))?;
        factory(home, options)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// whether the running kernel knows the overlay filesystem
///
/// a best-effort `modprobe overlay` runs first so the probe does not fail
/// just because the module was never loaded.
pub(crate) fn supports_overlay() -> Result<()> {
    let _ = std::process::Command::new("modprobe")
        .arg("overlay")
        .status();

    let f = File::open("/proc/filesystems").with_path("/proc/filesystems")?;
    for line in BufReader::new(f).lines() {
        let line = line.with_path("/proc/filesystems")?;
        if line == "nodev\toverlay" {
            return Ok(());
        }
    }
    tracing::error!(
        "'overlay' not found as a supported filesystem on this host. \
         Please ensure kernel is new enough and has overlay support loaded."
    );
    Err(Error::DriverNotSupported)
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// random identifier over a base32 alphabet
///
/// short link tokens keep the overlay2 mount option string inside the
/// page-size bound.
pub(crate) fn generate_id(length: usize) -> String {
    let mut out = String::with_capacity(length);
    while out.len() < length {
        for byte in uuid::Uuid::new_v4().into_bytes() {
            if out.len() == length {
                break;
            }
            out.push(ID_ALPHABET[(byte % 32) as usize] as char);
        }
    }
    out
}

/// random 64-character hex id for layer and mount directories
pub fn generate_layer_id() -> String {
    let mut out = String::with_capacity(64);
    out.push_str(&hex::encode(uuid::Uuid::new_v4().into_bytes()));
    out.push_str(&hex::encode(uuid::Uuid::new_v4().into_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_length_and_alphabet() {
        for len in [1, 26, 64] {
            let id = generate_id(len);
            assert_eq!(id.len(), len);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_generate_ids_unique() {
        let a = generate_id(26);
        let b = generate_id(26);
        assert_ne!(a, b);

        assert_eq!(generate_layer_id().len(), 64);
        assert_ne!(generate_layer_id(), generate_layer_id());
    }

    #[test]
    fn test_registry_unknown_driver() {
        let registry = DriverRegistry::with_builtin();
        let err = registry
            .create("devicemapper", Path::new("/tmp"), &[])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDriver(_)));
    }

    #[test]
    fn test_registry_snapshot_overlay_unsupported() {
        let registry = DriverRegistry::with_builtin();
        let err = registry
            .create("snapshot-overlay", Path::new("/tmp"), &[])
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
