use std::path::Path;

use nix::mount::{mount, umount, MsFlags};
use nix::sys::statfs::statfs;
use tracing::debug;

use crate::error::{Error, Result};

/// overlayfs superblock magic, for mountpoint detection
pub const FS_MAGIC_OVERLAY: i64 = 0x794c7630;
pub const FS_MAGIC_AUFS: i64 = 0x61756673;
pub const FS_MAGIC_BTRFS: i64 = 0x9123683e;
pub const FS_MAGIC_ZFS: i64 = 0x2fc12fc1;
pub const FS_MAGIC_EXT4: i64 = 0xef53;
pub const FS_MAGIC_XFS: i64 = 0x58465342;
pub const FS_MAGIC_TMPFS: i64 = 0x01021994;

/// filesystem magic of the filesystem backing a path
pub fn fs_magic(path: &Path) -> Result<i64> {
    let stat = statfs(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    })?;
    Ok(stat.filesystem_type().0 as i64)
}

/// human name of a backing filesystem, for driver status output
pub fn fs_name(magic: i64) -> &'static str {
    match magic {
        FS_MAGIC_OVERLAY => "overlayfs",
        FS_MAGIC_AUFS => "aufs",
        FS_MAGIC_BTRFS => "btrfs",
        FS_MAGIC_ZFS => "zfs",
        FS_MAGIC_EXT4 => "extfs",
        FS_MAGIC_XFS => "xfs",
        FS_MAGIC_TMPFS => "tmpfs",
        _ => "<unknown>",
    }
}

/// the kernel page size, bounding the mount options string
pub fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

/// combine mount options with an selinux context label
pub fn format_mount_label(opts: &str, mount_label: &str) -> String {
    if mount_label.is_empty() {
        opts.to_string()
    } else if opts.is_empty() {
        format!("context=\"{mount_label}\"")
    } else {
        format!("{opts},context=\"{mount_label}\"")
    }
}

/// perform the overlay mount syscall onto `target` with prepared options
pub fn mount_overlay(target: &Path, data: &str) -> Result<()> {
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data),
    )
    .map_err(|e| Error::Mount {
        path: target.to_path_buf(),
        source: std::io::Error::from(e),
    })
}

/// unmount a path, tolerating targets that are not mounted
pub fn unmount(target: &Path) -> Result<()> {
    match umount(target) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
            debug!(path = %target.display(), "unmount of a non-mounted path");
            Ok(())
        }
        Err(e) => Err(Error::Unmount {
            path: target.to_path_buf(),
            source: std::io::Error::from(e),
        }),
    }
}

/// whether `dir` is an active mountpoint of the given filesystem type
pub fn mounted(magic: i64, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    Ok(fs_magic(dir)? == magic)
}

/// make a directory a private mount so mounts below it do not propagate
///
/// the directory is bind-mounted onto itself first when it is not already
/// a mountpoint.
pub fn make_private(path: &Path) -> Result<()> {
    let flags = MsFlags::MS_PRIVATE;
    if mount(None::<&str>, path, None::<&str>, flags, None::<&str>).is_ok() {
        return Ok(());
    }
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .and_then(|()| mount(None::<&str>, path, None::<&str>, flags, None::<&str>))
    .map_err(|e| Error::Mount {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    })
}
