use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::archive::{self, ApplyBehavior, Change};
use crate::cancel::CancelToken;
use crate::driver::mount::{
    format_mount_label, fs_magic, fs_name, make_private, mount_overlay, mounted, page_size,
    unmount, FS_MAGIC_AUFS, FS_MAGIC_BTRFS, FS_MAGIC_OVERLAY, FS_MAGIC_ZFS,
};
use crate::driver::{
    copy_dir, get_kernel_version, naive, supports_overlay, CopyFlags, Driver, KernelVersion,
    RefCounter,
};
use crate::error::{Error, IoResultExt, Result, ResultExt};

// This backend uses the overlay union filesystem for containers plus hard
// link file sharing for images.
//
// Each layer can have a "root" subdirectory which is a plain filesystem
// hierarchy, or it can use overlay. In multi-lower mode a layer has a
// "diff" directory and a "lower" file, as well as "merged" and "work"
// directories. The "lower" file contains all the lower layer diff paths
// separated by ":" and ordered from uppermost to lowermost. When the
// lower list gets too long for a single mount, the driver merges the
// bottom of the list into an "upper" directory paired with a "lower-id"
// file, which is what the legacy single-lower mode uses throughout.
//
// A kernel older than 4.0.0 or the "nomultilower" option selects the
// legacy mode, where a layer has an "upper" directory and the "lower-id"
// of the single parent whose "root" serves as the lower.

const DRIVER_NAME: &str = "overlay";

/// overlay union driver with legacy and multi-lower operating modes
pub struct OverlayDriver {
    home: PathBuf,
    path_cache: Mutex<HashMap<String, PathBuf>>,
    counter: RefCounter,
    multi_lower: bool,
    squash_level: usize,
    backing_fs: &'static str,
}

impl std::fmt::Debug for OverlayDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayDriver").field("home", &self.home).finish()
    }
}

impl OverlayDriver {
    pub fn new(home: &Path, options: &[String]) -> Result<Self> {
        supports_overlay()?;

        fs::create_dir_all(home).with_path(home)?;
        fs::set_permissions(home, Permissions::from_mode(0o700)).with_path(home)?;

        let magic = fs_magic(home)?;
        match magic {
            FS_MAGIC_BTRFS | FS_MAGIC_AUFS | FS_MAGIC_ZFS | FS_MAGIC_OVERLAY => {
                tracing::error!(
                    "'overlay' is not supported over {}",
                    fs_name(magic)
                );
                return Err(Error::IncompatibleFS);
            }
            _ => {}
        }

        make_private(home)?;

        let mut driver = Self::with_home(home, false, 0, fs_name(magic));

        if !options.iter().any(|o| o == "nomultilower") {
            if let Some(version) = get_kernel_version()? {
                if version >= KernelVersion::new(4, 0, 0) {
                    driver.multi_lower = true;
                    // each lower entry costs the id (64 bytes) plus the diff
                    // directory name and separators; reserve headroom for the
                    // upper and work directories and the mount label
                    let layer_arg_size = 71 + home.as_os_str().len();
                    driver.squash_level =
                        (page_size() - 256 - 2 * layer_arg_size) / layer_arg_size;
                    debug!(level = driver.squash_level, "setting squash level");
                }
            }
        }

        Ok(driver)
    }

    /// driver over an existing home directory, skipping the environment
    /// probes; used by tests that never mount
    #[cfg(test)]
    pub(crate) fn for_tests(home: &Path) -> Self {
        std::fs::create_dir_all(home).expect("create driver home");
        Self::with_home(home, true, 0, "extfs")
    }

    fn with_home(
        home: &Path,
        multi_lower: bool,
        squash_level: usize,
        backing_fs: &'static str,
    ) -> Self {
        Self {
            home: home.to_path_buf(),
            path_cache: Mutex::new(HashMap::new()),
            counter: RefCounter::new(),
            multi_lower,
            squash_level,
            backing_fs,
        }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    /// merge the given lower entries into a single hard-linked upper
    /// directory, reusing an existing squash if one is present
    fn squash_layers(&self, layer_dirs: &[&str]) -> Result<String> {
        let first = self.home.join(layer_dirs[0]);
        let meta = first.symlink_metadata().with_path(&first)?;
        let layer_id = Path::new(layer_dirs[0])
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidResourcePath(layer_dirs[0].to_string()))?;

        let dir = self.dir(&layer_id);
        let upper_dir = dir.join("upper");
        if upper_dir.exists() {
            return Ok(format!("{layer_id}/upper"));
        }

        let tmp_upper = dir.join(format!("tmpupper-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&tmp_upper).with_path(&tmp_upper)?;

        let result = (|| -> Result<()> {
            use std::os::unix::fs::MetadataExt;
            fs::set_permissions(&tmp_upper, Permissions::from_mode(meta.mode() & 0o7777))
                .with_path(&tmp_upper)?;
            for layer_dir in layer_dirs.iter().rev() {
                // hard links share file data: this upper will not be
                // written to while mounted, the diff directory still takes
                // the writes
                copy_dir(
                    &self.home.join(layer_dir),
                    &tmp_upper,
                    CopyFlags {
                        hardlink: true,
                        overwrite: true,
                    },
                )?;
            }
            fs::rename(&tmp_upper, &upper_dir).with_path(&upper_dir)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp_upper);
            result?;
        }
        Ok(format!("{layer_id}/upper"))
    }

    /// construct the colon-separated lower list for a child of `parent`,
    /// squashing the bottom of the list when it grows past the limit
    fn get_lower(&self, parent: &str) -> Result<String> {
        let parent_dir = self.dir(parent);
        parent_dir.symlink_metadata().with_path(&parent_dir)?;

        // a parent with a root is the single lower
        if parent_dir.join("root").exists() {
            return Ok(String::new());
        }

        let diff_dir = parent_dir.join("diff");
        if diff_dir.symlink_metadata().is_ok() {
            let mut lowers = vec![format!("{parent}/diff")];
            if let Ok(parent_lower) = fs::read_to_string(parent_dir.join("lower")) {
                let parent_lowers: Vec<&str> = parent_lower.split(':').collect();
                if self.squash_level > 0 && parent_lowers.len() >= self.squash_level {
                    let squash_index = (0.8 * self.squash_level as f64) as usize;
                    lowers.extend(parent_lowers[..squash_index].iter().map(|s| s.to_string()));
                    let squashed = self.squash_layers(&parent_lowers[squash_index..])?;
                    debug!(
                        count = parent_lowers.len() - squash_index,
                        squashed = %squashed,
                        "squashing layers"
                    );
                    lowers.push(squashed);
                } else {
                    lowers.extend(parent_lowers.iter().map(|s| s.to_string()));
                }
            }
            return Ok(lowers.join(":"));
        }

        // legacy parent: its upper is the lower
        let parent_upper = parent_dir.join("upper");
        parent_upper.symlink_metadata().with_path(&parent_upper)?;
        Ok(format!("{parent}/upper"))
    }

    fn get_lower_dirs(&self, id: &str, lower_id: &str) -> Result<Vec<PathBuf>> {
        let mut lowers = Vec::new();
        match fs::read_to_string(self.dir(id).join("lower")) {
            Ok(contents) => {
                for entry in contents.split(':') {
                    lowers.push(self.home.join(entry));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Io {
                    path: self.dir(id).join("lower"),
                    source: e,
                })
            }
        }
        lowers.push(self.dir(lower_id).join("root"));
        Ok(lowers)
    }

    fn lower_id(&self, id: &str) -> Result<String> {
        let path = self.dir(id).join("lower-id");
        Ok(fs::read_to_string(&path).with_path(&path)?.trim().to_string())
    }

    fn get_diff_path(&self, id: &str, parent: Option<&str>) -> Option<PathBuf> {
        let dir = self.dir(id);

        let diff_path = dir.join("diff");
        if diff_path.exists() {
            return Some(diff_path);
        }

        // legacy upper is reusable only when the stored lower-id matches
        // the requested parent
        let upper_path = dir.join("upper");
        if upper_path.exists() {
            if let (Ok(lower_id), Some(parent)) = (self.lower_id(id), parent) {
                if lower_id == parent {
                    return Some(upper_path);
                }
            }
        }

        None
    }

    fn parent_layer_paths(&self, id: &str) -> Result<Vec<PathBuf>> {
        let lower_id = self.lower_id(id)?;
        self.get_lower_dirs(id, &lower_id)
    }

    fn classic_apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let dir = self.dir(id);

        let Some(parent) = parent else {
            return naive::apply_diff(self, id, diff, cancel);
        };
        let parent_root = self.dir(parent).join("root");
        if !parent_root.exists() {
            return naive::apply_diff(self, id, diff, cancel);
        }

        // the parent has a full root: hard link it into place and apply the
        // layer on top. this relies on apply running once per layer on a
        // clean upper, with no in-place rewrites of linked files.
        let tmp_root = dir.join(format!("tmproot-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&tmp_root).with_path(&tmp_root)?;

        let result = (|| -> Result<u64> {
            copy_dir(
                &parent_root,
                &tmp_root,
                CopyFlags {
                    hardlink: true,
                    overwrite: false,
                },
            )?;
            let size = archive::apply(diff, &tmp_root, ApplyBehavior::Delete, cancel)?;
            fs::rename(&tmp_root, dir.join("root")).with_path(dir.join("root"))?;
            Ok(size)
        })();

        match result {
            Ok(size) => {
                for stale in ["upper", "work", "merged"] {
                    let _ = fs::remove_dir_all(dir.join(stale));
                }
                let _ = fs::remove_file(dir.join("lower-id"));
                Ok(size)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_root);
                Err(e)
            }
        }
    }

    fn create_dirs(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let dir = self.dir(id);

        // toplevel images are just a root dir
        let Some(parent) = parent else {
            mkdir_as(&dir.join("root"), 0o755)?;
            return Ok(());
        };

        let parent_dir = self.dir(parent);
        parent_dir.symlink_metadata().with_path(&parent_dir)?;

        mkdir_as(&dir.join("work"), 0o700)?;
        mkdir_as(&dir.join("merged"), 0o700)?;

        // a parent with a root is overlaid directly
        let parent_root = parent_dir.join("root");
        if let Ok(meta) = parent_root.symlink_metadata() {
            use std::os::unix::fs::MetadataExt;
            let mode = meta.mode() & 0o7777;
            if self.multi_lower {
                mkdir_as(&dir.join("diff"), mode)?;
            } else {
                mkdir_as(&dir.join("upper"), mode)?;
            }
            fs::write(dir.join("lower-id"), parent).with_path(dir.join("lower-id"))?;
            return Ok(());
        }

        // otherwise inherit the lower-id and either copy the parent upper
        // (legacy) or write the constructed lower list (multi-lower)
        let lower_id = self.lower_id(parent)?;
        fs::write(dir.join("lower-id"), &lower_id).with_path(dir.join("lower-id"))?;

        if !self.multi_lower {
            use std::os::unix::fs::MetadataExt;
            let parent_upper = parent_dir.join("upper");
            let meta = parent_upper.symlink_metadata().with_path(&parent_upper)?;
            let upper = dir.join("upper");
            mkdir_as(&upper, meta.mode() & 0o7777)?;
            return copy_dir(&parent_upper, &upper, CopyFlags::default());
        }

        let lower = self.get_lower(parent)?;
        if !lower.is_empty() {
            fs::write(dir.join("lower"), &lower).with_path(dir.join("lower"))?;
        }
        mkdir_as(&dir.join("diff"), 0o755)?;
        Ok(())
    }
}

fn mkdir_as(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir(path).with_path(path)?;
    fs::set_permissions(path, Permissions::from_mode(mode)).with_path(path)
}

impl Driver for OverlayDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        _mount_label: &str,
        storage_opt: &HashMap<String, String>,
    ) -> Result<()> {
        if !storage_opt.is_empty() {
            return Err(Error::StorageOptNotSupported(DRIVER_NAME));
        }

        let dir = self.dir(id);
        if let Some(home) = dir.parent() {
            fs::create_dir_all(home).with_path(home)?;
        }
        mkdir_as(&dir, 0o700)?;

        let result = self.create_dirs(id, parent);
        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io { path: dir, source: e }),
        }
        self.path_cache
            .lock()
            .expect("path cache poisoned")
            .remove(id);
        Ok(())
    }

    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        let dir = self.dir(id);
        dir.symlink_metadata().with_path(&dir)?;

        // a layer with a root needs no mount
        let root_dir = dir.join("root");
        if root_dir.exists() {
            self.path_cache
                .lock()
                .expect("path cache poisoned")
                .insert(id.to_string(), root_dir.clone());
            return Ok(root_dir);
        }

        let lower_id = self.lower_id(id)?;

        let (lower_dirs, upper_dir) = if dir.join("diff").exists() {
            let lowers = self.get_lower_dirs(id, &lower_id)?;
            let joined = lowers
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":");
            (joined, dir.join("diff"))
        } else {
            (
                self.dir(&lower_id).join("root").display().to_string(),
                dir.join("upper"),
            )
        };

        let work_dir = dir.join("work");
        let merged_dir = dir.join("merged");

        if self.counter.increment(id) > 1 {
            return Ok(merged_dir);
        }

        // already mounted by an earlier process
        match mounted(FS_MAGIC_OVERLAY, &merged_dir) {
            Ok(true) => {
                self.counter.decrement(id);
                return Ok(merged_dir);
            }
            Ok(false) => {}
            Err(e) => {
                self.counter.decrement(id);
                return Err(e);
            }
        }

        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower_dirs,
            upper_dir.display(),
            work_dir.display()
        );
        let mount_data = format_mount_label(&opts, mount_label);
        if mount_data.len() > page_size() {
            self.counter.decrement(id);
            return Err(Error::MountLabelTooLarge(mount_data.len()));
        }

        if let Err(e) = mount_overlay(&merged_dir, &mount_data) {
            self.counter.decrement(id);
            return Err(e);
        }

        self.path_cache
            .lock()
            .expect("path cache poisoned")
            .insert(id.to_string(), merged_dir.clone());

        Ok(merged_dir)
    }

    fn put(&self, id: &str) -> Result<()> {
        if self.counter.decrement(id) > 0 {
            return Ok(());
        }
        let cached = self
            .path_cache
            .lock()
            .expect("path cache poisoned")
            .get(id)
            .cloned();

        let mountpoint = match cached {
            Some(p) => p,
            None => {
                debug!(id, "put on a non-mounted device");
                // it might still be there from a previous process
                let fallback = self.dir(id).join("merged");
                self.path_cache
                    .lock()
                    .expect("path cache poisoned")
                    .insert(id.to_string(), fallback.clone());
                fallback
            }
        };

        if mounted(FS_MAGIC_OVERLAY, &mountpoint)? {
            if let Err(e) = unmount(&mountpoint) {
                debug!(id, error = %e, "failed to unmount overlay");
                return Err(e);
            }
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).exists()
    }

    fn metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        let dir = self.dir(id);
        dir.symlink_metadata().with_path(&dir)?;

        let mut metadata = HashMap::new();

        // a layer with a root is an image layer
        let root_dir = dir.join("root");
        if root_dir.exists() {
            metadata.insert("RootDir".to_string(), root_dir.display().to_string());
            return Ok(metadata);
        }

        metadata.insert("WorkDir".to_string(), dir.join("work").display().to_string());
        metadata.insert(
            "MergedDir".to_string(),
            dir.join("merged").display().to_string(),
        );

        let lower_id = self.lower_id(id)?;

        if dir.join("diff").symlink_metadata().is_err() {
            metadata.insert(
                "LowerDir".to_string(),
                self.dir(&lower_id).join("root").display().to_string(),
            );
            metadata.insert("UpperDir".to_string(), dir.join("upper").display().to_string());
            return Ok(metadata);
        }

        let lower_dirs = self.get_lower_dirs(id, &lower_id)?;
        metadata.insert(
            "LowerDir".to_string(),
            lower_dirs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":"),
        );
        metadata.insert("UpperDir".to_string(), dir.join("diff").display().to_string());
        Ok(metadata)
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![("Backing Filesystem".to_string(), self.backing_fs.to_string())]
    }

    fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<u64> {
        if !self.multi_lower {
            return self.classic_apply_diff(id, parent, diff, cancel);
        }

        let dir = self.dir(id);
        let apply_dir = if parent.is_none() {
            dir.join("root")
        } else {
            dir.join("diff")
        };

        debug!(path = %apply_dir.display(), "applying tar");
        // overlay does not need the parent to apply the diff
        archive::apply(diff, &apply_dir, ApplyBehavior::ConvertToOverlay, cancel)
            .context("apply tar failed")?;

        self.diff_size(id, parent)
    }

    fn diff(&self, id: &str, parent: Option<&str>) -> Result<Box<dyn Read + Send>> {
        let bytes = match self.get_diff_path(id, parent) {
            Some(diff_path) => {
                debug!(path = %diff_path.display(), "tar with options");
                archive::pack_diff(&diff_path)?
            }
            None => naive::diff(self, id, parent)?,
        };
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64> {
        match self.get_diff_path(id, parent) {
            Some(diff_path) => archive::directory_size(&diff_path),
            None => naive::diff_size(self, id, parent),
        }
    }

    fn changes(&self, id: &str, parent: Option<&str>) -> Result<Vec<Change>> {
        // overlay has no snapshots; changes come from the upper against
        // every parent layer
        match self.get_diff_path(id, parent) {
            Some(diff_path) => {
                let layers = self.parent_layer_paths(id)?;
                archive::overlay_changes(&layers, &diff_path)
            }
            None => naive::changes(self, id, parent),
        }
    }

    fn cleanup(&self) -> Result<()> {
        if let Err(e) = unmount(&self.home) {
            warn!(error = %e, "failed to unmount driver home");
        }
        Ok(())
    }
}
