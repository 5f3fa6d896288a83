use crate::digest::Digest;
use crate::error::Result;
use crate::manifest::{path_cmp, Attrs, DeviceKind, Manifest, Resource};
use crate::tarsplit::{SplitObserver, TarMember, TarMemberKind};

/// a hard link kept aside while building a manifest
#[derive(Clone, Debug, PartialEq)]
pub struct HardLink {
    pub source: String,
    pub target: String,
}

/// accumulates resources from tar members as the splitter walks a stream
///
/// hard links are recorded separately from ordinary resources; `build`
/// returns the resources in strict path order.
#[derive(Default)]
pub struct ManifestBuilder {
    resources: Vec<Resource>,
    hard_links: Vec<HardLink>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(mut self) -> Result<(Manifest, Vec<HardLink>)> {
        self.resources
            .sort_by(|a, b| path_cmp(a.path(), b.path()));
        Ok((Manifest::new(self.resources)?, self.hard_links))
    }
}

/// normalise a tar member name to an absolute manifest path
fn clean_name(name: &[u8]) -> String {
    let s = String::from_utf8_lossy(name);
    let trimmed = s.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn attrs_for(member: &TarMember) -> Attrs {
    Attrs {
        mode: member.mode,
        uid: member.uid,
        gid: member.gid,
        mtime: member.mtime,
        atime: member.atime,
        xattrs: member.xattrs.clone(),
    }
}

impl SplitObserver for ManifestBuilder {
    fn member(&mut self, member: &TarMember, digest: Option<&Digest>) -> Result<()> {
        let path = clean_name(&member.name);
        let attrs = attrs_for(member);

        match member.kind {
            TarMemberKind::Regular => self.resources.push(Resource::RegularFile {
                paths: vec![path],
                attrs,
                size: member.size,
                digests: digest.cloned().into_iter().collect(),
            }),
            TarMemberKind::Directory => {
                self.resources.push(Resource::Directory { path, attrs })
            }
            TarMemberKind::Symlink => self.resources.push(Resource::Symlink {
                path,
                attrs,
                target: String::from_utf8_lossy(&member.link_name).into_owned(),
            }),
            TarMemberKind::HardLink => self.hard_links.push(HardLink {
                source: path,
                target: clean_name(&member.link_name),
            }),
            TarMemberKind::CharDevice => self.resources.push(Resource::Device {
                path,
                attrs,
                kind: DeviceKind::Char,
                major: member.dev_major,
                minor: member.dev_minor,
            }),
            TarMemberKind::BlockDevice => self.resources.push(Resource::Device {
                path,
                attrs,
                kind: DeviceKind::Block,
                major: member.dev_major,
                minor: member.dev_minor,
            }),
            TarMemberKind::Fifo => {
                self.resources.push(Resource::NamedPipe { path, attrs })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn member(name: &str, kind: TarMemberKind) -> TarMember {
        TarMember {
            name: name.as_bytes().to_vec(),
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            atime: None,
            link_name: Vec::new(),
            dev_major: 0,
            dev_minor: 0,
            xattrs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_paths_are_absolute_and_sorted() {
        let mut b = ManifestBuilder::new();
        b.member(&member("z", TarMemberKind::Regular), Some(&Digest::from_bytes(b"z")))
            .unwrap();
        b.member(&member("a/", TarMemberKind::Directory), None).unwrap();
        b.member(&member("a/file", TarMemberKind::Regular), Some(&Digest::from_bytes(b"f")))
            .unwrap();

        let (m, links) = b.build().unwrap();
        let paths: Vec<&str> = m.resources.iter().map(|r| r.path()).collect();
        assert_eq!(paths, vec!["/a", "/a/file", "/z"]);
        assert!(links.is_empty());
    }

    #[test]
    fn test_hard_links_kept_aside() {
        let mut b = ManifestBuilder::new();
        b.member(&member("orig", TarMemberKind::Regular), Some(&Digest::from_bytes(b"o")))
            .unwrap();
        let mut link = member("copy", TarMemberKind::HardLink);
        link.link_name = b"orig".to_vec();
        b.member(&link, None).unwrap();

        let (m, links) = b.build().unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(
            links,
            vec![HardLink {
                source: "/copy".to_string(),
                target: "/orig".to_string(),
            }]
        );
    }

    #[test]
    fn test_device_and_fifo_variants() {
        let mut b = ManifestBuilder::new();
        let mut dev = member("dev/null", TarMemberKind::CharDevice);
        dev.dev_major = 1;
        dev.dev_minor = 3;
        b.member(&dev, None).unwrap();
        b.member(&member("run/pipe", TarMemberKind::Fifo), None).unwrap();

        let (m, _) = b.build().unwrap();
        match m.get("/dev/null").unwrap() {
            Resource::Device { kind, major, minor, .. } => {
                assert_eq!(*kind, DeviceKind::Char);
                assert_eq!((*major, *minor), (1, 3));
            }
            other => panic!("unexpected resource {other:?}"),
        }
        assert!(matches!(
            m.get("/run/pipe").unwrap(),
            Resource::NamedPipe { .. }
        ));
    }
}
