use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

use crate::blobstore::BlobStore;
use crate::error::{Error, IoResultExt, Result};
use crate::manifest::{Attrs, DeviceKind, Manifest, Resource};

/// materialise a manifest into a checkout directory
///
/// resources are applied in path order so directories exist before their
/// contents. ownership is applied only when running privileged; device
/// nodes that cannot be created without privileges are skipped with a
/// warning, matching how image layers degrade on unprivileged hosts.
pub fn apply_manifest(target: &Path, manifest: &Manifest, blobs: &BlobStore) -> Result<()> {
    fs::create_dir_all(target).with_path(target)?;

    for resource in &manifest.resources {
        let full = resolve(target, resource.path())?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        match resource {
            Resource::Directory { attrs, .. } => {
                if !full.is_dir() {
                    fs::create_dir(&full).with_path(&full)?;
                }
                apply_attrs(&full, attrs)?;
            }
            Resource::RegularFile {
                attrs, digests, size, ..
            } => {
                let mut file = File::create(&full).with_path(&full)?;
                if let Some(digest) = digests.first() {
                    let mut reader = blobs
                        .reader(digest)
                        .map_err(|e| e.context("failed to read content blob"))?;
                    let copied = std::io::copy(&mut reader, &mut file).with_path(&full)?;
                    if copied != *size {
                        return Err(Error::CorruptEntry(format!(
                            "blob {} is {} bytes, expected {}",
                            digest, copied, size
                        )));
                    }
                }
                file.flush().with_path(&full)?;
                drop(file);
                apply_attrs(&full, attrs)?;
            }
            Resource::Symlink { attrs, target: link, .. } => {
                if fs::symlink_metadata(&full).is_ok() {
                    fs::remove_file(&full).with_path(&full)?;
                }
                symlink(link, &full).with_path(&full)?;
                best_effort_chown(&full, attrs.uid, attrs.gid);
            }
            Resource::Device {
                attrs,
                kind,
                major,
                minor,
                ..
            } => {
                let sflag = match kind {
                    DeviceKind::Char => SFlag::S_IFCHR,
                    DeviceKind::Block => SFlag::S_IFBLK,
                };
                match mknod(
                    &full,
                    sflag,
                    Mode::from_bits_truncate(attrs.mode),
                    makedev(*major as u64, *minor as u64),
                ) {
                    Ok(()) => apply_attrs(&full, attrs)?,
                    Err(nix::errno::Errno::EPERM) => {
                        warn!(path = %full.display(), "skipping device node without privileges");
                    }
                    Err(e) => {
                        return Err(Error::Io {
                            path: full,
                            source: std::io::Error::from(e),
                        })
                    }
                }
            }
            Resource::NamedPipe { attrs, .. } => {
                nix::unistd::mkfifo(&full, Mode::from_bits_truncate(attrs.mode)).map_err(
                    |e| Error::Io {
                        path: full.clone(),
                        source: std::io::Error::from(e),
                    },
                )?;
                apply_attrs(&full, attrs)?;
            }
        }
    }
    Ok(())
}

fn apply_attrs(path: &Path, attrs: &Attrs) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(attrs.mode & 0o7777)).with_path(path)?;
    best_effort_chown(path, attrs.uid, attrs.gid);
    for (name, value) in &attrs.xattrs {
        if let Err(e) = xattr::set(path, name, value) {
            debug!(path = %path.display(), xattr = name, error = %e, "failed to set xattr");
        }
    }
    Ok(())
}

fn best_effort_chown(path: &Path, uid: u32, gid: u32) {
    if !nix::unistd::geteuid().is_root() {
        return;
    }
    if let Err(e) = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        warn!(path = %path.display(), error = %e, "failed to chown");
    }
}

/// join a manifest path under the checkout root, refusing traversal
fn resolve(target: &Path, path: &str) -> Result<PathBuf> {
    let rel = Path::new(path.trim_start_matches('/'));
    let mut out = target.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(Error::InvalidResourcePath(path.to_string())),
        }
    }
    if out == target {
        return Err(Error::InvalidResourcePath(path.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn attrs(mode: u32) -> Attrs {
        Attrs {
            mode,
            ..Attrs::default()
        }
    }

    #[test]
    fn test_apply_manifest_materialises_tree() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();
        let digest = blobs.put(b"file contents").unwrap();

        let manifest = Manifest::new(vec![
            Resource::Directory {
                path: "/etc".to_string(),
                attrs: attrs(0o755),
            },
            Resource::RegularFile {
                paths: vec!["/etc/hostname".to_string()],
                attrs: attrs(0o644),
                size: 13,
                digests: vec![digest],
            },
            Resource::Symlink {
                path: "/etc/alias".to_string(),
                attrs: attrs(0o777),
                target: "hostname".to_string(),
            },
        ])
        .unwrap();

        let out = dir.path().join("checkout");
        apply_manifest(&out, &manifest, &blobs).unwrap();

        assert_eq!(fs::read(out.join("etc/hostname")).unwrap(), b"file contents");
        assert_eq!(
            fs::read_link(out.join("etc/alias")).unwrap(),
            PathBuf::from("hostname")
        );
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            fs::metadata(out.join("etc/hostname")).unwrap().mode() & 0o7777,
            0o644
        );
    }

    #[test]
    fn test_apply_manifest_size_mismatch() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();
        let digest = blobs.put(b"short").unwrap();

        let manifest = Manifest::new(vec![Resource::RegularFile {
            paths: vec!["/f".to_string()],
            attrs: attrs(0o644),
            size: 100,
            digests: vec![digest],
        }])
        .unwrap();

        let err = apply_manifest(&dir.path().join("out"), &manifest, &blobs).unwrap_err();
        assert!(matches!(err, Error::CorruptEntry(_)));
    }

    #[test]
    fn test_apply_manifest_rejects_traversal() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();

        let mut manifest = Manifest::empty();
        manifest.resources.push(Resource::Directory {
            path: "/../escape".to_string(),
            attrs: attrs(0o755),
        });

        let err = apply_manifest(&dir.path().join("out"), &manifest, &blobs).unwrap_err();
        assert!(matches!(err, Error::InvalidResourcePath(_)));
    }

    #[test]
    fn test_apply_manifest_sets_user_xattrs() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();

        let mut xattrs = BTreeMap::new();
        xattrs.insert("user.origin".to_string(), b"layer".to_vec());
        let manifest = Manifest::new(vec![Resource::Directory {
            path: "/marked".to_string(),
            attrs: Attrs {
                mode: 0o755,
                xattrs,
                ..Attrs::default()
            },
        }])
        .unwrap();

        let out = dir.path().join("out");
        apply_manifest(&out, &manifest, &blobs).unwrap();

        if let Ok(Some(value)) = xattr::get(out.join("marked"), "user.origin") {
            assert_eq!(value, b"layer");
        }
    }

    #[test]
    fn test_apply_empty_digest_list_creates_empty_file() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();

        let manifest = Manifest::new(vec![Resource::RegularFile {
            paths: vec!["/empty".to_string()],
            attrs: attrs(0o600),
            size: 0,
            digests: vec![],
        }])
        .unwrap();

        let out = dir.path().join("out");
        apply_manifest(&out, &manifest, &blobs).unwrap();
        assert_eq!(fs::read(out.join("empty")).unwrap(), b"");
    }

    #[test]
    fn test_unused_digest_reference() {
        // every referenced blob must be present in the store
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(&dir.path().join("blobs")).unwrap();

        let manifest = Manifest::new(vec![Resource::RegularFile {
            paths: vec!["/f".to_string()],
            attrs: attrs(0o644),
            size: 4,
            digests: vec![Digest::from_bytes(b"never stored")],
        }])
        .unwrap();

        let err = apply_manifest(&dir.path().join("out"), &manifest, &blobs).unwrap_err();
        assert!(err.to_string().contains("blob not found"));
    }
}
