use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive::pack::TarAppender;
use crate::archive::{Change, ChangeKind, OPAQUE_XATTR};
use crate::error::{Error, IoResultExt, Result};

/// changes recorded by an overlay upper directory against its lower stack
///
/// the upper diff is walked directly: 0:0 character devices report
/// deletions, opaque directories mask the lower subtree, everything else
/// is an addition or a modification depending on whether any lower layer
/// has the path.
pub fn overlay_changes(lowers: &[PathBuf], diff_dir: &Path) -> Result<Vec<Change>> {
    let mut changes = Vec::new();

    for entry in WalkDir::new(diff_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io {
            path: diff_dir.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(diff_dir)
            .expect("walked path is under root");
        let logical = Path::new("/").join(rel);
        let meta = entry.path().symlink_metadata().with_path(entry.path())?;

        if meta.file_type().is_char_device() && meta.rdev() == 0 {
            changes.push(Change {
                path: logical,
                kind: ChangeKind::Deleted,
            });
            continue;
        }

        let in_lower = lower_path(lowers, rel).is_some();
        if meta.is_dir() {
            let opaque =
                xattr::get(entry.path(), OPAQUE_XATTR).ok().flatten().as_deref() == Some(b"y".as_slice());
            if opaque {
                changes.push(Change {
                    path: logical.clone(),
                    kind: ChangeKind::Modified,
                });
                // lower children with no replacement in the diff are gone
                if let Some(lower_dir) = lower_path(lowers, rel) {
                    for child in fs::read_dir(&lower_dir).with_path(&lower_dir)? {
                        let child = child.with_path(&lower_dir)?;
                        if !entry.path().join(child.file_name()).exists() {
                            changes.push(Change {
                                path: logical.join(child.file_name()),
                                kind: ChangeKind::Deleted,
                            });
                        }
                    }
                }
                continue;
            }
            if in_lower {
                // directory already existed; only report it when metadata
                // actually moved, which the walk cannot cheaply prove, so
                // report children only
                continue;
            }
            changes.push(Change {
                path: logical,
                kind: ChangeKind::Added,
            });
        } else {
            changes.push(Change {
                path: logical,
                kind: if in_lower {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                },
            });
        }
    }

    Ok(changes)
}

/// first lower layer containing `rel`, searching top to bottom
fn lower_path(lowers: &[PathBuf], rel: &Path) -> Option<PathBuf> {
    lowers.iter().map(|l| l.join(rel)).find(|p| {
        fs::symlink_metadata(p).is_ok()
    })
}

/// naive change list between two materialised trees
pub fn changes_dirs(old: &Path, new: &Path) -> Result<Vec<Change>> {
    let mut changes = Vec::new();
    collect_changes(old, new, Path::new(""), &mut changes)?;
    Ok(changes)
}

fn collect_changes(
    old_root: &Path,
    new_root: &Path,
    rel: &Path,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let old_dir = old_root.join(rel);
    let new_dir = new_root.join(rel);

    let mut names: Vec<std::ffi::OsString> = Vec::new();
    let mut seen = HashSet::new();
    for dir in [&old_dir, &new_dir] {
        if dir.is_dir() {
            for child in fs::read_dir(dir).with_path(dir)? {
                let name = child.with_path(dir)?.file_name();
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
    }
    names.sort();

    for name in names {
        let child_rel = rel.join(&name);
        let logical = Path::new("/").join(&child_rel);
        let old_meta = fs::symlink_metadata(old_root.join(&child_rel)).ok();
        let new_meta = fs::symlink_metadata(new_root.join(&child_rel)).ok();

        match (old_meta, new_meta) {
            (None, Some(new_meta)) => {
                changes.push(Change {
                    path: logical,
                    kind: ChangeKind::Added,
                });
                if new_meta.is_dir() {
                    collect_changes(old_root, new_root, &child_rel, changes)?;
                }
            }
            (Some(_), None) => {
                changes.push(Change {
                    path: logical,
                    kind: ChangeKind::Deleted,
                });
            }
            (Some(old_meta), Some(new_meta)) => {
                let both_dirs = old_meta.is_dir() && new_meta.is_dir();
                if !both_dirs && metadata_differs(&old_meta, &new_meta) {
                    changes.push(Change {
                        path: logical,
                        kind: ChangeKind::Modified,
                    });
                }
                if both_dirs {
                    collect_changes(old_root, new_root, &child_rel, changes)?;
                }
            }
            (None, None) => unreachable!("name came from one of the trees"),
        }
    }
    Ok(())
}

fn metadata_differs(old: &fs::Metadata, new: &fs::Metadata) -> bool {
    old.mode() != new.mode()
        || old.uid() != new.uid()
        || old.gid() != new.gid()
        || old.len() != new.len()
        || old.mtime() != new.mtime()
        || old.mtime_nsec() != new.mtime_nsec()
}

/// export a change list as an uncompressed tar in wire form
///
/// added and modified paths are read from `dir`; deletions become `.wh.`
/// members.
pub fn export_changes(dir: &Path, changes: &[Change]) -> Result<Vec<u8>> {
    let mut appender = TarAppender::new(dir);

    for change in changes {
        let rel = change
            .path
            .strip_prefix("/")
            .unwrap_or(&change.path)
            .to_path_buf();
        match change.kind {
            ChangeKind::Deleted => {
                let parent_meta = dir
                    .join(rel.parent().unwrap_or(Path::new("")))
                    .symlink_metadata()
                    .or_else(|_| dir.symlink_metadata())
                    .with_path(dir)?;
                appender.append_whiteout(&rel, &parent_meta)?;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                let meta = dir.join(&rel).symlink_metadata().with_path(dir.join(&rel))?;
                appender.append(&rel, &meta)?;
            }
        }
    }

    appender.finish()
}

/// total bytes under a directory, counting each inode once
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut seen = HashSet::new();
    let mut total = 0u64;

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        let meta = entry.path().symlink_metadata().with_path(entry.path())?;
        if !meta.is_file() {
            continue;
        }
        if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        total += meta.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::apply::{apply, ApplyBehavior};
    use crate::cancel::CancelToken;
    use tempfile::tempdir;

    fn change(path: &str, kind: ChangeKind) -> Change {
        Change {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn test_changes_dirs_add_modify_delete() {
        let old = tempdir().unwrap();
        let new = tempdir().unwrap();

        fs::write(old.path().join("gone"), b"x").unwrap();
        fs::write(old.path().join("changed"), b"before").unwrap();
        fs::write(new.path().join("changed"), b"after, longer").unwrap();
        fs::write(new.path().join("fresh"), b"hello").unwrap();
        fs::create_dir(new.path().join("newdir")).unwrap();
        fs::write(new.path().join("newdir/inner"), b"i").unwrap();

        let changes = changes_dirs(old.path(), new.path()).unwrap();
        assert!(changes.contains(&change("/gone", ChangeKind::Deleted)));
        assert!(changes.contains(&change("/fresh", ChangeKind::Added)));
        assert!(changes.contains(&change("/newdir", ChangeKind::Added)));
        assert!(changes.contains(&change("/newdir/inner", ChangeKind::Added)));
        // "changed" differs in mtime or size
        assert!(changes
            .iter()
            .any(|c| c.path == PathBuf::from("/changed") && c.kind == ChangeKind::Modified));
    }

    #[test]
    fn test_changes_dirs_identical_trees() {
        let old = tempdir().unwrap();
        fs::write(old.path().join("same"), b"s").unwrap();
        let changes = changes_dirs(old.path(), old.path()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_export_changes_roundtrip() {
        let tree = tempdir().unwrap();
        fs::write(tree.path().join("added"), b"new file").unwrap();

        let changes = vec![
            change("/added", ChangeKind::Added),
            change("/removed", ChangeKind::Deleted),
        ];
        let tar_bytes = export_changes(tree.path(), &changes).unwrap();

        // applying the exported tar onto a tree with /removed deletes it
        let dst = tempdir().unwrap();
        fs::write(dst.path().join("removed"), b"old").unwrap();
        apply(
            tar_bytes.as_slice(),
            dst.path(),
            ApplyBehavior::Delete,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(dst.path().join("added")).unwrap(), b"new file");
        assert!(!dst.path().join("removed").exists());
    }

    #[test]
    fn test_overlay_changes_add_and_modify() {
        let lower = tempdir().unwrap();
        fs::write(lower.path().join("present"), b"lower").unwrap();

        let diff = tempdir().unwrap();
        fs::write(diff.path().join("present"), b"upper").unwrap();
        fs::write(diff.path().join("brand-new"), b"x").unwrap();

        let changes = overlay_changes(&[lower.path().to_path_buf()], diff.path()).unwrap();
        assert!(changes.contains(&change("/present", ChangeKind::Modified)));
        assert!(changes.contains(&change("/brand-new", ChangeKind::Added)));
    }

    #[test]
    fn test_directory_size_counts_inodes_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();
        fs::write(dir.path().join("c"), vec![0u8; 50]).unwrap();

        assert_eq!(directory_size(dir.path()).unwrap(), 150);
    }
}
