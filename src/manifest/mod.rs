//! ordered filesystem manifests and the merge-with-whiteouts operator
//!
//! a manifest is an ordered sequence of resources describing one layer (or
//! a merged stack of layers). two orderings exist: strict lexicographic
//! (overlay) and aufs ordering, where `.wh.<name>` whiteouts sort adjacent
//! to the entry they delete.

mod builder;
mod merge;
mod resource;

pub use builder::{HardLink, ManifestBuilder};
pub use merge::{merge_aufs, merge_overlay, Whiteout};
pub use resource::{Attrs, DeviceKind, Resource};

use std::cmp::Ordering as CmpOrdering;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const AUFS_WHITEOUT_PREFIX: &str = ".wh.";
pub const AUFS_OPAQUE_DIR: &str = ".wh..wh..opq";

/// xattr marking an overlay directory opaque
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// an ordered sequence of filesystem resources
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub resources: Vec<Resource>,
}

impl Manifest {
    pub fn new(resources: Vec<Resource>) -> Result<Self> {
        for r in &resources {
            if r.path().is_empty() {
                return Err(Error::InvalidResourcePath(String::new()));
            }
        }
        Ok(Self { resources })
    }

    pub fn empty() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// encode as cbor for blob storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    /// decode from cbor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }

    /// decode from a reader
    pub fn decode_from<R: Read>(reader: R) -> Result<Self> {
        Ok(ciborium::from_reader(reader)?)
    }

    /// look up a resource by exact path
    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.path() == path)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// strict lexicographic path comparison
pub fn path_cmp(p1: &str, p2: &str) -> CmpOrdering {
    p1.cmp(p2)
}

/// aufs path comparison: whiteouts sort adjacent to the name they delete
pub fn aufs_path_cmp(p1: &str, p2: &str) -> CmpOrdering {
    if aufs_path_less(p1, p2) {
        CmpOrdering::Less
    } else if aufs_path_less(p2, p1) {
        CmpOrdering::Greater
    } else {
        CmpOrdering::Equal
    }
}

/// split into (directory-with-trailing-slash, basename)
pub(crate) fn split_path(p: &str) -> (&str, &str) {
    match p.rfind('/') {
        Some(i) => (&p[..i + 1], &p[i + 1..]),
        None => ("", p),
    }
}

fn aufs_path_less(p1: &str, p2: &str) -> bool {
    let (d1, n1) = split_path(p1);
    let (d2, n2) = split_path(p2);
    if d1 == d2 {
        return aufs_less(n1, n2);
    }
    if d1.len() < d2.len() && d2.starts_with(d1) {
        return aufs_less(&p1[d1.len()..], &p2[d1.len()..]);
    }
    if d1.len() > d2.len() && d1.starts_with(d2) {
        return aufs_less(&p1[d2.len()..], &p2[d2.len()..]);
    }
    p1 < p2
}

// whiteout-prefix handling is deliberately asymmetric when one side is
// empty, matching the reference comparator
fn aufs_less(n1: &str, n2: &str) -> bool {
    if let Some(s1) = n1.strip_prefix(AUFS_WHITEOUT_PREFIX) {
        if let Some(s2) = n2.strip_prefix(AUFS_WHITEOUT_PREFIX) {
            return aufs_less(s1, s2);
        }
        return !n2.is_empty();
    } else if n2.starts_with(AUFS_WHITEOUT_PREFIX) {
        return n1.is_empty();
    }
    n1 < n2
}
