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
    format_mount_label, fs_magic, fs_name, make_private, mounted, page_size, unmount,
    FS_MAGIC_AUFS, FS_MAGIC_BTRFS, FS_MAGIC_OVERLAY, FS_MAGIC_ZFS,
};
use crate::driver::{
    generate_id, get_kernel_version, supports_overlay, Driver, KernelVersion, RefCounter,
};
use crate::error::{Error, IoResultExt, Result, ResultExt};

// This backend uses the overlay union filesystem with a diff directory
// per layer, always in multi-lower mode. Layer directories are referenced
// through short random tokens symlinked under "l/" so the colon-separated
// lowerdir option stays within the page-size bound of the mount call.

const DRIVER_NAME: &str = "overlay2";
const LINK_DIR: &str = "l";
const LOWER_FILE: &str = "lower";
const MAX_DEPTH: usize = 128;

// idLength represents the number of random characters which can be used
// to create the unique link identifier for every layer. If this value is
// too long then the page size limit for the mount command may be
// exceeded. The idLength should be selected such that
// ((idLength + len(linkDir) + 1) * maxDepth) <= (pageSize - 512)
const ID_LENGTH: usize = 26;

/// overlay union driver with short link names and a hard lower-list cap
pub struct Overlay2Driver {
    home: PathBuf,
    path_cache: Mutex<HashMap<String, PathBuf>>,
    counter: RefCounter,
    backing_fs: &'static str,
}

impl std::fmt::Debug for Overlay2Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay2Driver").field("home", &self.home).finish()
    }
}

impl Overlay2Driver {
    pub fn new(home: &Path, _options: &[String]) -> Result<Self> {
        supports_overlay()?;

        match get_kernel_version()? {
            Some(version) if version >= KernelVersion::new(4, 0, 0) => {}
            _ => return Err(Error::DriverNotSupported),
        }

        fs::create_dir_all(home.join(LINK_DIR)).with_path(home)?;
        fs::set_permissions(home, Permissions::from_mode(0o700)).with_path(home)?;

        let magic = fs_magic(home)?;
        match magic {
            FS_MAGIC_BTRFS | FS_MAGIC_AUFS | FS_MAGIC_ZFS | FS_MAGIC_OVERLAY => {
                tracing::error!("'overlay' is not supported over {}", fs_name(magic));
                return Err(Error::IncompatibleFS);
            }
            _ => {}
        }

        make_private(home)?;

        Ok(Self::with_home(home, fs_name(magic)))
    }

    fn with_home(home: &Path, backing_fs: &'static str) -> Self {
        Self {
            home: home.to_path_buf(),
            path_cache: Mutex::new(HashMap::new()),
            counter: RefCounter::new(),
            backing_fs,
        }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    fn get_diff_path(&self, id: &str) -> PathBuf {
        self.dir(id).join("diff")
    }

    /// lower list for a child of `parent`: the parent's link plus the
    /// parent's own lowers, capped at the maximum mountable depth
    fn get_lower(&self, parent: &str) -> Result<String> {
        let parent_dir = self.dir(parent);
        parent_dir.symlink_metadata().with_path(&parent_dir)?;

        let parent_link =
            fs::read_to_string(parent_dir.join("link")).with_path(parent_dir.join("link"))?;
        let mut lowers = vec![format!("{LINK_DIR}/{}", parent_link.trim())];

        if let Ok(parent_lower) = fs::read_to_string(parent_dir.join(LOWER_FILE)) {
            lowers.extend(parent_lower.split(':').map(|s| s.to_string()));
        }
        if lowers.len() > MAX_DEPTH {
            return Err(Error::MaxDepthExceeded);
        }
        Ok(lowers.join(":"))
    }

    /// resolve the lower links of a layer back to layer diff directories
    fn get_lower_dirs(&self, id: &str) -> Result<Vec<PathBuf>> {
        let mut lowers = Vec::new();
        match fs::read_to_string(self.dir(id).join(LOWER_FILE)) {
            Ok(contents) => {
                for entry in contents.split(':') {
                    let link = self.home.join(entry);
                    let target = fs::read_link(&link).with_path(&link)?;
                    let resolved = normalize(&self.home.join(target));
                    lowers.push(resolved);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Io {
                    path: self.dir(id).join(LOWER_FILE),
                    source: e,
                })
            }
        }
        Ok(lowers)
    }
}

/// lexically resolve `..` components, the way the link targets are laid
/// out relative to the home directory
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

impl Driver for Overlay2Driver {
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
        fs::create_dir_all(&dir).with_path(&dir)?;
        fs::set_permissions(&dir, Permissions::from_mode(0o700)).with_path(&dir)?;

        let result = (|| -> Result<()> {
            let diff = dir.join("diff");
            fs::create_dir(&diff).with_path(&diff)?;
            fs::set_permissions(&diff, Permissions::from_mode(0o755)).with_path(&diff)?;

            let lid = generate_id(ID_LENGTH);
            std::os::unix::fs::symlink(
                Path::new("..").join(id).join("diff"),
                self.home.join(LINK_DIR).join(&lid),
            )
            .with_path(self.home.join(LINK_DIR).join(&lid))?;
            fs::write(dir.join("link"), &lid).with_path(dir.join("link"))?;

            let Some(parent) = parent else {
                return Ok(());
            };

            let work = dir.join("work");
            fs::create_dir(&work).with_path(&work)?;
            fs::set_permissions(&work, Permissions::from_mode(0o700)).with_path(&work)?;
            let merged = dir.join("merged");
            fs::create_dir(&merged).with_path(&merged)?;
            fs::set_permissions(&merged, Permissions::from_mode(0o700)).with_path(&merged)?;

            let lower = self.get_lower(parent)?;
            if !lower.is_empty() {
                fs::write(dir.join(LOWER_FILE), &lower).with_path(dir.join(LOWER_FILE))?;
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir(id);
        if let Ok(link) = fs::read_to_string(dir.join("link")) {
            let _ = fs::remove_file(self.home.join(LINK_DIR).join(link.trim()));
        }
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

        let diff_dir = dir.join("diff");
        let lowers = match fs::read_to_string(dir.join(LOWER_FILE)) {
            Ok(lowers) => lowers,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // no lower: the diff directory is the layer
                self.path_cache
                    .lock()
                    .expect("path cache poisoned")
                    .insert(id.to_string(), diff_dir.clone());
                return Ok(diff_dir);
            }
            Err(e) => {
                return Err(Error::Io {
                    path: dir.join(LOWER_FILE),
                    source: e,
                })
            }
        };

        let merged_dir = dir.join("merged");

        if self.counter.increment(id) > 1 {
            return Ok(merged_dir);
        }

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

        // relative paths keep the option string within the page size; the
        // mount binary runs with the driver home as its working directory
        let opts = format!(
            "lowerdir={},upperdir={}/diff,workdir={}/work",
            lowers, id, id
        );
        let mount_data = format_mount_label(&opts, mount_label);
        if mount_data.len() > page_size() {
            self.counter.decrement(id);
            return Err(Error::MountLabelTooLarge(mount_data.len()));
        }

        let status = std::process::Command::new("mount")
            .args(["-t", "overlay", "overlay", "-o", &mount_data])
            .arg(Path::new(id).join("merged"))
            .current_dir(&self.home)
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                self.counter.decrement(id);
                return Err(Error::Mount {
                    path: merged_dir,
                    source: std::io::Error::other(format!("mount exited with {status}")),
                });
            }
            Err(e) => {
                self.counter.decrement(id);
                return Err(Error::Mount {
                    path: merged_dir,
                    source: e,
                });
            }
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
        metadata.insert("WorkDir".to_string(), dir.join("work").display().to_string());
        metadata.insert(
            "MergedDir".to_string(),
            dir.join("merged").display().to_string(),
        );
        metadata.insert("UpperDir".to_string(), dir.join("diff").display().to_string());

        let lower_dirs = self.get_lower_dirs(id)?;
        if !lower_dirs.is_empty() {
            metadata.insert(
                "LowerDir".to_string(),
                lower_dirs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            );
        }
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
        let apply_dir = self.get_diff_path(id);

        debug!(path = %apply_dir.display(), "applying tar");
        // overlay does not need the parent to apply the diff
        archive::apply(diff, &apply_dir, ApplyBehavior::ConvertToOverlay, cancel)
            .context("apply tar failed")?;

        self.diff_size(id, parent)
    }

    fn diff(&self, id: &str, _parent: Option<&str>) -> Result<Box<dyn Read + Send>> {
        let diff_path = self.get_diff_path(id);
        debug!(path = %diff_path.display(), "tar with options");
        let bytes = archive::pack_diff(&diff_path)?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64> {
        archive::directory_size(&self.get_diff_path(id))
    }

    fn changes(&self, id: &str, _parent: Option<&str>) -> Result<Vec<Change>> {
        // changes come from the upper against every lower layer
        let layers = self.get_lower_dirs(id)?;
        archive::overlay_changes(&layers, &self.get_diff_path(id))
    }

    fn cleanup(&self) -> Result<()> {
        if let Err(e) = unmount(&self.home) {
            warn!(error = %e, "failed to unmount driver home");
        }
        Ok(())
    }
}
