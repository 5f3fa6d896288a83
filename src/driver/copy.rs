use std::fs::{self, Permissions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{makedev, major, minor, mknod, Mode, SFlag};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

/// options for recursive directory copies
#[derive(Clone, Copy, Default)]
pub struct CopyFlags {
    /// share regular file data through hard links instead of copying
    pub hardlink: bool,
    /// replace entries that already exist in the destination
    pub overwrite: bool,
}

/// recursively copy `src` into `dst`
///
/// directories are recreated (never hard-linked); regular files are
/// hard-linked when requested so layer data is shared rather than
/// duplicated.
pub fn copy_dir(src: &Path, dst: &Path, flags: CopyFlags) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io {
            path: src.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked path is under root");
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata().with_path(entry.path())?;
        let file_type = meta.file_type();

        if flags.overwrite {
            match fs::symlink_metadata(&target) {
                Ok(existing) if existing.is_dir() && file_type.is_dir() => {}
                Ok(existing) => {
                    if existing.is_dir() {
                        fs::remove_dir_all(&target).with_path(&target)?;
                    } else {
                        fs::remove_file(&target).with_path(&target)?;
                    }
                }
                Err(_) => {}
            }
        }

        if file_type.is_dir() {
            if !target.is_dir() {
                fs::create_dir(&target).with_path(&target)?;
            }
            fs::set_permissions(&target, Permissions::from_mode(meta.mode() & 0o7777))
                .with_path(&target)?;
        } else if file_type.is_file() {
            if flags.hardlink {
                fs::hard_link(entry.path(), &target).with_path(&target)?;
            } else {
                fs::copy(entry.path(), &target).with_path(&target)?;
            }
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).with_path(entry.path())?;
            std::os::unix::fs::symlink(&link, &target).with_path(&target)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let sflag = if file_type.is_char_device() {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            let rdev = meta.rdev();
            match mknod(
                &target,
                sflag,
                Mode::from_bits_truncate(meta.mode() & 0o7777),
                makedev(major(rdev), minor(rdev)),
            ) {
                Ok(()) => {}
                Err(nix::errno::Errno::EPERM) => {
                    warn!(path = %target.display(), "skipping device node without privileges");
                }
                Err(e) => {
                    return Err(Error::Io {
                        path: target,
                        source: std::io::Error::from(e),
                    })
                }
            }
        } else if file_type.is_fifo() {
            nix::unistd::mkfifo(&target, Mode::from_bits_truncate(meta.mode() & 0o7777))
                .map_err(|e| Error::Io {
                    path: target.clone(),
                    source: std::io::Error::from(e),
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_with_hardlinks_shares_data() {
        let src = tempdir().unwrap();
        fs::create_dir(src.path().join("d")).unwrap();
        fs::write(src.path().join("d/f"), b"shared").unwrap();

        let dst = tempdir().unwrap();
        copy_dir(
            src.path(),
            dst.path(),
            CopyFlags {
                hardlink: true,
                overwrite: false,
            },
        )
        .unwrap();

        let src_meta = fs::metadata(src.path().join("d/f")).unwrap();
        let dst_meta = fs::metadata(dst.path().join("d/f")).unwrap();
        assert_eq!(src_meta.ino(), dst_meta.ino());
        // directories are recreated, not linked
        assert_ne!(
            fs::metadata(src.path().join("d")).unwrap().ino(),
            fs::metadata(dst.path().join("d")).unwrap().ino()
        );
    }

    #[test]
    fn test_copy_without_hardlinks() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("f"), b"copied").unwrap();

        let dst = tempdir().unwrap();
        copy_dir(src.path(), dst.path(), CopyFlags::default()).unwrap();

        assert_eq!(fs::read(dst.path().join("f")).unwrap(), b"copied");
        assert_ne!(
            fs::metadata(src.path().join("f")).unwrap().ino(),
            fs::metadata(dst.path().join("f")).unwrap().ino()
        );
    }

    #[test]
    fn test_overwrite_replaces_existing() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("f"), b"new content").unwrap();

        let dst = tempdir().unwrap();
        fs::write(dst.path().join("f"), b"old").unwrap();

        copy_dir(
            src.path(),
            dst.path(),
            CopyFlags {
                hardlink: true,
                overwrite: true,
            },
        )
        .unwrap();
        assert_eq!(fs::read(dst.path().join("f")).unwrap(), b"new content");
    }

    #[test]
    fn test_copy_symlinks_preserved() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink("real", src.path().join("sym")).unwrap();

        let dst = tempdir().unwrap();
        copy_dir(src.path(), dst.path(), CopyFlags::default()).unwrap();

        assert_eq!(
            fs::read_link(dst.path().join("sym")).unwrap(),
            std::path::PathBuf::from("real")
        );
    }
}
