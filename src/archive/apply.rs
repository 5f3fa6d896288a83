use std::fs::{self, File, Permissions};
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

use crate::archive::{OPAQUE_XATTR, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX};
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};

/// how whiteout members in the incoming stream are materialised
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApplyBehavior {
    /// apply onto a flat root: whiteouts delete the named paths, opaque
    /// markers clear the directory
    Delete,
    /// apply into an overlay upper: whiteouts become 0:0 char devices,
    /// opaque markers become the overlay opaque xattr
    ConvertToOverlay,
    /// keep `.wh.` members verbatim as regular files
    Keep,
}

/// apply an uncompressed tar stream onto a directory, returning the number
/// of payload bytes written
pub fn apply<R: Read>(
    reader: R,
    dest: &Path,
    behavior: ApplyBehavior,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    let mut size: u64 = 0;

    for entry in archive.entries().with_path(dest)? {
        cancel.check()?;
        let mut entry = entry.with_path(dest)?;

        let rel = entry.path().with_path(dest)?.into_owned();
        let Some(target) = safe_join(dest, &rel) else {
            return Err(Error::CorruptTar(format!(
                "tar member escapes destination: {}",
                rel.display()
            )));
        };

        let base = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if behavior != ApplyBehavior::Keep && base.starts_with(WHITEOUT_PREFIX) {
            let parent = target.parent().unwrap_or(dest).to_path_buf();
            if base == WHITEOUT_OPAQUE_DIR {
                apply_opaque(&parent, behavior)?;
            } else {
                let original = parent.join(&base[WHITEOUT_PREFIX.len()..]);
                apply_whiteout(&original, &entry, behavior)?;
            }
            continue;
        }

        size += unpack_member(&mut entry, dest, &target)?;
    }

    Ok(size)
}

fn apply_opaque(dir: &Path, behavior: ApplyBehavior) -> Result<()> {
    fs::create_dir_all(dir).with_path(dir)?;
    match behavior {
        ApplyBehavior::Delete => {
            // the lower content under this directory is fully masked
            for child in fs::read_dir(dir).with_path(dir)? {
                let child = child.with_path(dir)?.path();
                if child.is_dir() && !child.is_symlink() {
                    fs::remove_dir_all(&child).with_path(&child)?;
                } else {
                    fs::remove_file(&child).with_path(&child)?;
                }
            }
        }
        ApplyBehavior::ConvertToOverlay => {
            xattr::set(dir, OPAQUE_XATTR, b"y").map_err(|e| Error::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        ApplyBehavior::Keep => unreachable!(),
    }
    Ok(())
}

fn apply_whiteout<R: Read>(
    original: &Path,
    entry: &tar::Entry<'_, R>,
    behavior: ApplyBehavior,
) -> Result<()> {
    match behavior {
        ApplyBehavior::Delete => {
            match fs::symlink_metadata(original) {
                Ok(meta) if meta.is_dir() => {
                    fs::remove_dir_all(original).with_path(original)?
                }
                Ok(_) => fs::remove_file(original).with_path(original)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io {
                    path: original.to_path_buf(),
                    source: e,
                }),
            }
        }
        ApplyBehavior::ConvertToOverlay => {
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent).with_path(parent)?;
            }
            mknod(
                original,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o600),
                makedev(0, 0),
            )
            .map_err(|e| Error::Io {
                path: original.to_path_buf(),
                source: std::io::Error::from(e),
            })?;
            let header = entry.header();
            best_effort_chown(
                original,
                header.uid().unwrap_or(0) as u32,
                header.gid().unwrap_or(0) as u32,
            );
        }
        ApplyBehavior::Keep => unreachable!(),
    }
    Ok(())
}

fn unpack_member<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest: &Path,
    target: &Path,
) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    let header = entry.header();
    let mode = header.mode().unwrap_or(0o644);
    let uid = header.uid().unwrap_or(0) as u32;
    let gid = header.gid().unwrap_or(0) as u32;
    let kind = header.entry_type();
    let mut written = 0u64;

    match kind {
        tar::EntryType::Directory => {
            if !target.is_dir() {
                fs::create_dir_all(target).with_path(target)?;
            }
            fs::set_permissions(target, Permissions::from_mode(mode)).with_path(target)?;
        }
        tar::EntryType::Symlink => {
            let link = entry
                .link_name()
                .with_path(target)?
                .ok_or_else(|| Error::CorruptTar("symlink without target".to_string()))?;
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).with_path(target)?;
            }
            symlink(&link, target).with_path(target)?;
        }
        tar::EntryType::Link => {
            let link = entry
                .link_name()
                .with_path(target)?
                .ok_or_else(|| Error::CorruptTar("hard link without target".to_string()))?;
            // hard-link targets are member names, relative to the layer root
            let stripped = link.strip_prefix("/").unwrap_or(&link);
            let link_target = safe_join(dest, stripped).ok_or_else(|| {
                Error::CorruptTar(format!("hard link escapes destination: {}", link.display()))
            })?;
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).with_path(target)?;
            }
            fs::hard_link(&link_target, target).with_path(target)?;
        }
        tar::EntryType::Char | tar::EntryType::Block => {
            let sflag = if kind == tar::EntryType::Char {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            let major = header.device_major().with_path(target)?.unwrap_or(0);
            let minor = header.device_minor().with_path(target)?.unwrap_or(0);
            match mknod(
                target,
                sflag,
                Mode::from_bits_truncate(mode),
                makedev(major as u64, minor as u64),
            ) {
                Ok(()) => {}
                Err(nix::errno::Errno::EPERM) => {
                    // device nodes need privileges; skip rather than fail
                    warn!(path = %target.display(), "skipping device node without privileges");
                    return Ok(0);
                }
                Err(e) => {
                    return Err(Error::Io {
                        path: target.to_path_buf(),
                        source: std::io::Error::from(e),
                    })
                }
            }
        }
        tar::EntryType::Fifo => {
            nix::unistd::mkfifo(target, Mode::from_bits_truncate(mode)).map_err(|e| {
                Error::Io {
                    path: target.to_path_buf(),
                    source: std::io::Error::from(e),
                }
            })?;
        }
        _ => {
            // regular files and anything file-like
            let mut file = File::create(target).with_path(target)?;
            written = std::io::copy(entry, &mut file).with_path(target)?;
            file.sync_all().with_path(target)?;
            fs::set_permissions(target, Permissions::from_mode(mode)).with_path(target)?;
        }
    }

    if kind != tar::EntryType::Symlink {
        best_effort_chown(target, uid, gid);
    }
    apply_pax_xattrs(entry, target)?;

    Ok(written)
}

/// pax SCHILY.xattr records carry the member's extended attributes
fn apply_pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> Result<()> {
    let Ok(Some(extensions)) = entry.pax_extensions() else {
        return Ok(());
    };
    for ext in extensions.flatten() {
        let Some(key) = ext.key().ok().and_then(|k| k.strip_prefix("SCHILY.xattr.")) else {
            continue;
        };
        if let Err(e) = xattr::set(target, key, ext.value_bytes()) {
            debug!(path = %target.display(), xattr = key, error = %e, "failed to set xattr");
        }
    }
    Ok(())
}

/// chown when running privileged; otherwise leave ownership alone
fn best_effort_chown(path: &Path, uid: u32, gid: u32) {
    if !nix::unistd::geteuid().is_root() {
        return;
    }
    if let Err(e) = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        warn!(path = %path.display(), error = %e, "failed to chown");
    }
}

/// join a tar member name under the destination, refusing traversal
fn safe_join(dest: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = dest.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out == dest {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tar_with(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            match content {
                Some(data) => {
                    let mut h = tar::Header::new_ustar();
                    h.set_path(name).unwrap();
                    h.set_size(data.len() as u64);
                    h.set_mode(0o644);
                    h.set_cksum();
                    builder.append(&h, *data).unwrap();
                }
                None => {
                    let mut h = tar::Header::new_ustar();
                    h.set_path(name).unwrap();
                    h.set_entry_type(tar::EntryType::Directory);
                    h.set_mode(0o755);
                    h.set_size(0);
                    h.set_cksum();
                    builder.append(&h, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_apply_plain_files() {
        let dir = tempdir().unwrap();
        let tar_bytes = tar_with(&[("d/", None), ("d/f", Some(b"data")), ("top", Some(b"x"))]);

        let size = apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Keep,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(size, 5);
        assert_eq!(fs::read(dir.path().join("d/f")).unwrap(), b"data");
        assert_eq!(fs::read(dir.path().join("top")).unwrap(), b"x");
    }

    #[test]
    fn test_apply_delete_whiteout_removes_target() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/victim"), b"bye").unwrap();
        fs::write(dir.path().join("keep"), b"ok").unwrap();

        let tar_bytes = tar_with(&[("sub/.wh.victim", Some(b""))]);
        apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Delete,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(!dir.path().join("sub/victim").exists());
        assert!(dir.path().join("keep").exists());
        // the marker itself is not materialised
        assert!(!dir.path().join("sub/.wh.victim").exists());
    }

    #[test]
    fn test_apply_delete_opaque_clears_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/old1"), b"1").unwrap();
        fs::create_dir(dir.path().join("d/olddir")).unwrap();
        fs::write(dir.path().join("d/olddir/nested"), b"2").unwrap();

        let tar_bytes = tar_with(&[("d/.wh..wh..opq", Some(b"")), ("d/new", Some(b"3"))]);
        apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Delete,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(!dir.path().join("d/old1").exists());
        assert!(!dir.path().join("d/olddir").exists());
        assert_eq!(fs::read(dir.path().join("d/new")).unwrap(), b"3");
    }

    #[test]
    fn test_apply_keep_preserves_markers() {
        let dir = tempdir().unwrap();
        let tar_bytes = tar_with(&[(".wh.gone", Some(b""))]);
        apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Keep,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(dir.path().join(".wh.gone").exists());
    }

    #[test]
    fn test_apply_rejects_traversal() {
        let dir = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        // bypass set_path's own normalisation to smuggle a dotdot
        h.as_gnu_mut().unwrap().name[..11].copy_from_slice(b"../escape\0\0");
        h.set_size(0);
        h.set_mode(0o644);
        h.set_cksum();
        builder.append(&h, std::io::empty()).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let result = apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Keep,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(Error::CorruptTar(_))));
    }

    #[test]
    fn test_apply_symlink_and_hardlink() {
        let dir = tempdir().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_ustar();
        h.set_path("orig").unwrap();
        h.set_size(3);
        h.set_mode(0o644);
        h.set_cksum();
        builder.append(&h, b"abc".as_slice()).unwrap();

        let mut link = tar::Header::new_ustar();
        link.set_path("hard").unwrap();
        link.set_entry_type(tar::EntryType::Link);
        link.set_link_name("orig").unwrap();
        link.set_size(0);
        link.set_cksum();
        builder.append(&link, std::io::empty()).unwrap();

        let mut sym = tar::Header::new_ustar();
        sym.set_path("soft").unwrap();
        sym.set_entry_type(tar::EntryType::Symlink);
        sym.set_link_name("orig").unwrap();
        sym.set_size(0);
        sym.set_cksum();
        builder.append(&sym, std::io::empty()).unwrap();

        let tar_bytes = builder.into_inner().unwrap();
        apply(
            tar_bytes.as_slice(),
            dir.path(),
            ApplyBehavior::Keep,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(dir.path().join("hard")).unwrap(), b"abc");
        assert_eq!(
            fs::read_link(dir.path().join("soft")).unwrap(),
            PathBuf::from("orig")
        );
    }
}
