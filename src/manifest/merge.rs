use std::cmp::Ordering as CmpOrdering;

use crate::manifest::{
    aufs_path_cmp, path_cmp, split_path, Manifest, Resource, AUFS_OPAQUE_DIR,
    AUFS_WHITEOUT_PREFIX, OVERLAY_OPAQUE_XATTR,
};

/// what a classifier decided about a diff resource
///
/// `path: None` means the resource is an ordinary entry. otherwise it
/// whites out `path`; `opaque` masks the whole subtree, and `replacement`
/// is emitted in place of the marker when present.
pub struct Whiteout {
    pub path: Option<String>,
    pub opaque: bool,
    pub replacement: Option<Resource>,
}

impl Whiteout {
    fn none() -> Self {
        Self {
            path: None,
            opaque: false,
            replacement: None,
        }
    }
}

/// merge a manifest produced from an overlay diff onto a base manifest
///
/// only the diff manifest should contain whiteout information.
pub fn merge_overlay(base: &Manifest, diff: &Manifest) -> Manifest {
    let mut r1 = base.resources.clone();
    r1.sort_by(|a, b| path_cmp(a.path(), b.path()));
    let mut r2 = diff.resources.clone();
    r2.sort_by(|a, b| path_cmp(a.path(), b.path()));
    merge_resources(&r1, &r2, overlay_whiteout, path_cmp)
}

/// merge a manifest produced from an aufs diff onto a base manifest
pub fn merge_aufs(base: &Manifest, diff: &Manifest) -> Manifest {
    let mut r1 = base.resources.clone();
    r1.sort_by(|a, b| aufs_path_cmp(a.path(), b.path()));
    let mut r2 = diff.resources.clone();
    r2.sort_by(|a, b| aufs_path_cmp(a.path(), b.path()));
    merge_resources(&r1, &r2, aufs_whiteout, aufs_path_cmp)
}

/// overlay classifier: opaque directories carry the overlay opaque xattr,
/// whiteouts are 0:0 character devices
fn overlay_whiteout(r: &Resource) -> Whiteout {
    match r {
        Resource::Directory { path, attrs } => {
            if attrs.xattrs.get(OVERLAY_OPAQUE_XATTR).map(Vec::as_slice) == Some(b"y".as_slice()) {
                let mut attrs = attrs.clone();
                attrs.xattrs.remove(OVERLAY_OPAQUE_XATTR);
                return Whiteout {
                    path: Some(path.clone()),
                    opaque: true,
                    replacement: Some(Resource::Directory {
                        path: path.clone(),
                        attrs,
                    }),
                };
            }
        }
        Resource::Device { path, major: 0, minor: 0, .. } => {
            return Whiteout {
                path: Some(path.clone()),
                opaque: false,
                replacement: None,
            };
        }
        _ => {}
    }
    Whiteout::none()
}

/// aufs classifier: `.wh..wh..opq` files make their directory opaque,
/// `.wh.<name>` files white out the sibling `<name>`
fn aufs_whiteout(r: &Resource) -> Whiteout {
    if let Resource::RegularFile { .. } = r {
        let (dir, fname) = split_path(r.path());
        if fname == AUFS_OPAQUE_DIR {
            tracing::debug!(path = %dir, "opaque directory marker");
            return Whiteout {
                path: Some(dir.to_string()),
                opaque: true,
                replacement: None,
            };
        }
        if let Some(stripped) = fname.strip_prefix(AUFS_WHITEOUT_PREFIX) {
            tracing::debug!(path = %format!("{dir}{stripped}"), "whiteout marker");
            return Whiteout {
                path: Some(format!("{dir}{stripped}")),
                opaque: false,
                replacement: None,
            };
        }
    }
    Whiteout::none()
}

/// tracks whiteouts seen so far; a whited-out path also suppresses its
/// entire subtree through the `name + "/"` form
#[derive(Default)]
struct WhiteoutContext {
    files: Vec<String>,
    dirs: Vec<String>,
}

impl WhiteoutContext {
    fn add(&mut self, name: &str) {
        self.files.push(name.to_string());
        self.dirs.push(as_dir(name));
    }

    fn is_whited_out(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
            || self.dirs.iter().any(|d| name.starts_with(d.as_str()))
    }
}

fn as_dir(name: &str) -> String {
    if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    }
}

/// classical merge-walk over two ordered resource sequences
fn merge_resources(
    r1: &[Resource],
    r2: &[Resource],
    wof: fn(&Resource) -> Whiteout,
    cmp: fn(&str, &str) -> CmpOrdering,
) -> Manifest {
    let mut result: Vec<Resource> = Vec::with_capacity(r1.len());
    let mut wc = WhiteoutContext::default();

    let mut i1 = 0;
    let mut i2 = 0;

    while i1 < r1.len() && i2 < r2.len() {
        let p1 = r1[i1].path();
        let p2 = r2[i2].path();

        match cmp(p1, p2) {
            CmpOrdering::Less => {
                if !wc.is_whited_out(p1) {
                    result.push(r1[i1].clone());
                }
                i1 += 1;
            }
            ordering => {
                if ordering == CmpOrdering::Equal {
                    // base entry replaced by the diff entry at the same path
                    i1 += 1;
                }
                let wo = wof(&r2[i2]);
                if let Some(path) = wo.path {
                    if wo.opaque {
                        let wod = as_dir(&path);
                        while i1 < r1.len() && r1[i1].path().starts_with(wod.as_str()) {
                            // everything under an opaque directory is masked
                            i1 += 1;
                        }
                        if let Some(replacement) = wo.replacement {
                            result.push(replacement);
                        }
                    } else {
                        wc.add(&path);
                    }
                } else {
                    result.push(r2[i2].clone());
                }
                i2 += 1;
            }
        }
    }

    while i1 < r1.len() {
        if !wc.is_whited_out(r1[i1].path()) {
            result.push(r1[i1].clone());
        }
        i1 += 1;
    }
    while i2 < r2.len() {
        let wo = wof(&r2[i2]);
        if let Some(_path) = wo.path {
            // trailing whiteouts have nothing left to mask; only opaque
            // replacements still contribute
            if wo.opaque {
                if let Some(replacement) = wo.replacement {
                    result.push(replacement);
                }
            }
        } else {
            result.push(r2[i2].clone());
        }
        i2 += 1;
    }

    Manifest { resources: result }
}
