use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor};
use walkdir::WalkDir;

use crate::archive::{OPAQUE_XATTR, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX};
use crate::error::{Error, IoResultExt, Result};

/// produce an uncompressed tar of an overlay upper directory in wire form
///
/// on-disk overlay markers are converted for transport: 0:0 character
/// devices become `.wh.<name>` members, opaque directory xattrs become
/// `.wh..wh..opq` members.
pub fn pack_diff(dir: &Path) -> Result<Vec<u8>> {
    let mut appender = TarAppender::new(dir);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walked path is under root")
            .to_path_buf();
        let meta = entry.path().symlink_metadata().with_path(entry.path())?;

        let file_type = meta.file_type();
        if file_type.is_char_device() && meta.rdev() == 0 {
            // whiteout marker
            appender.append_whiteout(&rel, &meta)?;
            continue;
        }
        appender.append(&rel, &meta)?;
        if file_type.is_dir() && read_xattr(entry.path(), OPAQUE_XATTR).as_deref() == Some(b"y".as_slice()) {
            appender.append_opaque(&rel, &meta)?;
        }
    }

    appender.finish()
}

fn read_xattr(path: &Path, name: &str) -> Option<Vec<u8>> {
    xattr::get(path, name).ok().flatten()
}

/// emits filesystem entries into a tar stream, detecting hard links by
/// inode
pub(crate) struct TarAppender<'a> {
    builder: tar::Builder<Vec<u8>>,
    root: &'a Path,
    seen: HashMap<(u64, u64), PathBuf>,
}

impl<'a> TarAppender<'a> {
    pub(crate) fn new(root: &'a Path) -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        Self {
            builder,
            root,
            seen: HashMap::new(),
        }
    }

    pub(crate) fn finish(self) -> Result<Vec<u8>> {
        self.builder.into_inner().with_path(self.root)
    }

    /// append the filesystem object at `<root>/<rel>` under the name `rel`
    pub(crate) fn append(&mut self, rel: &Path, meta: &fs::Metadata) -> Result<()> {
        let full = self.root.join(rel);
        let file_type = meta.file_type();

        let mut header = tar::Header::new_ustar();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_mtime(meta.mtime().max(0) as u64);
        header.set_size(0);

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            let mut name = rel.to_path_buf().into_os_string();
            name.push("/");
            self.append_with_xattrs(&full, header, PathBuf::from(name), std::io::empty())?;
        } else if file_type.is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            let target = fs::read_link(&full).with_path(&full)?;
            header
                .set_link_name(&target)
                .with_path(&full)?;
            self.builder
                .append_data(&mut header, rel, std::io::empty())
                .with_path(&full)?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                if let Some(first) = self.seen.get(&(meta.dev(), meta.ino())).cloned() {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_link_name(&first).with_path(&full)?;
                    self.append_with_xattrs(&full, header, rel.to_path_buf(), std::io::empty())?;
                    return Ok(());
                }
                self.seen
                    .insert((meta.dev(), meta.ino()), rel.to_path_buf());
            }
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let file = File::open(&full).with_path(&full)?;
            self.append_with_xattrs(&full, header, rel.to_path_buf(), file)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            header.set_device_major(major(meta.rdev()) as u32).with_path(&full)?;
            header.set_device_minor(minor(meta.rdev()) as u32).with_path(&full)?;
            self.append_with_xattrs(&full, header, rel.to_path_buf(), std::io::empty())?;
        } else if file_type.is_fifo() {
            header.set_entry_type(tar::EntryType::Fifo);
            self.append_with_xattrs(&full, header, rel.to_path_buf(), std::io::empty())?;
        }
        // sockets are not archivable; silently skipped like the reference
        // implementation

        Ok(())
    }

    /// append a `.wh.<name>` member whiting out `rel`
    pub(crate) fn append_whiteout(&mut self, rel: &Path, meta: &fs::Metadata) -> Result<()> {
        let parent = rel.parent().unwrap_or(Path::new(""));
        let base = rel
            .file_name()
            .ok_or_else(|| Error::InvalidResourcePath(rel.display().to_string()))?;
        let name = parent.join(format!("{}{}", WHITEOUT_PREFIX, base.to_string_lossy()));

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_mtime(meta.mtime().max(0) as u64);
        header.set_size(0);
        self.builder
            .append_data(&mut header, name, std::io::empty())
            .with_path(self.root)?;
        Ok(())
    }

    /// append the `.wh..wh..opq` marker inside `rel`
    pub(crate) fn append_opaque(&mut self, rel: &Path, meta: &fs::Metadata) -> Result<()> {
        let name = rel.join(WHITEOUT_OPAQUE_DIR);
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_mtime(meta.mtime().max(0) as u64);
        header.set_size(0);
        self.builder
            .append_data(&mut header, name, std::io::empty())
            .with_path(self.root)?;
        Ok(())
    }

    fn append_with_xattrs<R: std::io::Read>(
        &mut self,
        full: &Path,
        mut header: tar::Header,
        name: PathBuf,
        data: R,
    ) -> Result<()> {
        let records = collect_xattr_records(full);
        if !records.is_empty() {
            self.append_pax(&records)?;
        }
        self.builder
            .append_data(&mut header, name, data)
            .with_path(full)?;
        Ok(())
    }

    /// emit a pax extended header carrying SCHILY.xattr records for the
    /// next member
    fn append_pax(&mut self, records: &[(String, Vec<u8>)]) -> Result<()> {
        let mut payload = Vec::new();
        for (key, value) in records {
            payload.extend_from_slice(&pax_record(key, value));
        }

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::XHeader);
        header.set_mode(0o644);
        header.set_size(payload.len() as u64);
        self.builder
            .append_data(&mut header, "PaxHeaders/xattrs", payload.as_slice())
            .with_path(self.root)?;
        Ok(())
    }
}

/// extended attributes of a path as pax record keys, excluding the opaque
/// marker which is converted separately
fn collect_xattr_records(path: &Path) -> Vec<(String, Vec<u8>)> {
    let Ok(names) = xattr::list(path) else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for name in names {
        let name = name.to_string_lossy().into_owned();
        if name == OPAQUE_XATTR {
            continue;
        }
        if let Ok(Some(value)) = xattr::get(path, &name) {
            records.push((format!("SCHILY.xattr.{name}"), value));
        }
    }
    records
}

/// a pax record is `<len> <key>=<value>\n` where len counts the whole
/// record including itself
fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let base = 1 + key.len() + 1 + value.len() + 1;
    let mut len = base + base.to_string().len();
    // adding the length digits can grow the digit count once
    len = base + len.to_string().len();

    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(len.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out.push(b'\n');
    out
}
