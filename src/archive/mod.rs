//! tar application, diff-tar production and change detection for layer
//! directories
//!
//! whiteouts travel on the wire in aufs form (`.wh.` files); on disk an
//! overlay upper directory represents them as 0:0 character devices and
//! the `trusted.overlay.opaque` xattr. this module converts between the
//! two and computes change lists between layer trees.

mod apply;
mod changes;
mod pack;

pub use apply::{apply, ApplyBehavior};
pub use changes::{changes_dirs, directory_size, export_changes, overlay_changes};
pub use pack::pack_diff;

use std::path::PathBuf;

/// how a path differs from the lower state
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "A",
            ChangeKind::Modified => "C",
            ChangeKind::Deleted => "D",
        })
    }
}

/// one entry of a change list, path relative to the layer root with a
/// leading slash
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

pub(crate) const WHITEOUT_PREFIX: &str = ".wh.";
pub(crate) const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";
pub(crate) const OPAQUE_XATTR: &str = "trusted.overlay.opaque";
