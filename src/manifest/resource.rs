use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// attributes common to every resource variant
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Char,
    Block,
}

/// one entry in a filesystem manifest
///
/// hard links are not a variant: they are kept aside as records during
/// manifest construction and resolved at checkout time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    RegularFile {
        paths: Vec<String>,
        attrs: Attrs,
        size: u64,
        digests: Vec<Digest>,
    },
    Directory {
        path: String,
        attrs: Attrs,
    },
    Symlink {
        path: String,
        attrs: Attrs,
        target: String,
    },
    Device {
        path: String,
        attrs: Attrs,
        kind: DeviceKind,
        major: u32,
        minor: u32,
    },
    NamedPipe {
        path: String,
        attrs: Attrs,
    },
}

impl Resource {
    /// primary path of the resource
    pub fn path(&self) -> &str {
        match self {
            Resource::RegularFile { paths, .. } => paths.first().map(String::as_str).unwrap_or(""),
            Resource::Directory { path, .. }
            | Resource::Symlink { path, .. }
            | Resource::Device { path, .. }
            | Resource::NamedPipe { path, .. } => path,
        }
    }

    pub fn attrs(&self) -> &Attrs {
        match self {
            Resource::RegularFile { attrs, .. }
            | Resource::Directory { attrs, .. }
            | Resource::Symlink { attrs, .. }
            | Resource::Device { attrs, .. }
            | Resource::NamedPipe { attrs, .. } => attrs,
        }
    }

    pub fn xattrs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.attrs().xattrs
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Resource::Directory { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Resource::RegularFile { .. } => "regular file",
            Resource::Directory { .. } => "directory",
            Resource::Symlink { .. } => "symlink",
            Resource::Device { .. } => "device",
            Resource::NamedPipe { .. } => "named pipe",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_path() {
        let r = Resource::RegularFile {
            paths: vec!["/a".to_string(), "/b".to_string()],
            attrs: Attrs::default(),
            size: 0,
            digests: vec![],
        };
        assert_eq!(r.path(), "/a");

        let d = Resource::Directory {
            path: "/dir".to_string(),
            attrs: Attrs::default(),
        };
        assert_eq!(d.path(), "/dir");
        assert!(d.is_directory());
    }

    #[test]
    fn test_serde_tagging() {
        let r = Resource::Device {
            path: "/dev/null".to_string(),
            attrs: Attrs::default(),
            kind: DeviceKind::Char,
            major: 1,
            minor: 3,
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"type\":\"device\""));
        let back: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
