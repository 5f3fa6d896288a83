use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, IoResultExt, Result};

/// content-addressed byte storage keyed by digest
///
/// blobs live under `<root>/sha256/<hex>` with a sibling `<root>/tmp`
/// directory for stage-then-rename writes. entries are immutable; writing
/// a blob that already exists is a no-op.
pub struct BlobStore {
    blob_dir: PathBuf,
    tmp_dir: PathBuf,
    algorithm: Algorithm,
}

impl BlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        let blob_dir = root.join("sha256");
        fs::create_dir_all(&blob_dir).with_path(&blob_dir)?;
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&tmp_dir).with_path(&tmp_dir)?;
        Ok(Self {
            blob_dir,
            tmp_dir,
            algorithm: Algorithm::Sha256,
        })
    }

    /// stream a reader into the store, returning its digest
    ///
    /// content is written to a temp file while hashing, then renamed into
    /// place. the rename is the single atomic step; on failure the temp
    /// file is removed.
    pub fn digest<R: Read>(&self, reader: &mut R) -> Result<Digest> {
        let tmp_path = self.tmp_dir.join(format!("blob-{}", uuid::Uuid::new_v4()));

        let mut digester = Digester::new();
        let write_result = (|| -> Result<()> {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).with_path(&tmp_path)?;
                if n == 0 {
                    break;
                }
                digester.update(&buf[..n]);
                tmp_file.write_all(&buf[..n]).with_path(&tmp_path)?;
            }
            tmp_file.sync_all().with_path(&tmp_path)?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let digest = digester.finalize();
        let target = self.blob_dir.join(digest.hex());
        if target.exists() {
            // already ingested, keep the existing immutable entry
            fs::remove_file(&tmp_path).with_path(&tmp_path)?;
            return Ok(digest);
        }

        fs::rename(&tmp_path, &target).with_path(&target)?;
        Ok(digest)
    }

    /// write a byte slice, returning its digest
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let mut cursor = std::io::Cursor::new(data);
        self.digest(&mut cursor)
    }

    /// open a blob for reading
    pub fn reader(&self, digest: &Digest) -> Result<File> {
        let path = self.path(digest)?;
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BlobNotFound(digest.clone())
            } else {
                Error::Io { path, source: e }
            }
        })
    }

    /// read an entire blob into memory
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader(digest)?
            .read_to_end(&mut out)
            .with_path(self.path(digest)?)?;
        Ok(out)
    }

    /// filesystem path of a blob, for algorithms the store supports
    pub fn path(&self, digest: &Digest) -> Result<PathBuf> {
        if digest.algorithm() != self.algorithm {
            return Err(Error::BlobAlgorithmUnsupported(
                digest.algorithm().to_string(),
            ));
        }
        Ok(self.blob_dir.join(digest.hex()))
    }

    /// check whether a blob is present
    pub fn exists(&self, digest: &Digest) -> bool {
        self.path(digest).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_digest_and_read_back() {
        let dir = tempdir().unwrap();
        let bs = BlobStore::new(dir.path()).unwrap();

        let d = bs.put(b"hello, world").unwrap();
        assert_eq!(d, Digest::from_bytes(b"hello, world"));
        assert!(bs.exists(&d));
        assert_eq!(bs.read(&d).unwrap(), b"hello, world");
    }

    #[test]
    fn test_reingest_is_noop() {
        let dir = tempdir().unwrap();
        let bs = BlobStore::new(dir.path()).unwrap();

        let d1 = bs.put(b"same bytes").unwrap();
        let d2 = bs.put(b"same bytes").unwrap();
        assert_eq!(d1, d2);

        // tmp dir left clean
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("tmp")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_blob() {
        let dir = tempdir().unwrap();
        let bs = BlobStore::new(dir.path()).unwrap();

        let absent = Digest::from_bytes(b"never stored");
        assert!(matches!(bs.reader(&absent), Err(Error::BlobNotFound(_))));
    }

    #[test]
    fn test_path_layout() {
        let dir = tempdir().unwrap();
        let bs = BlobStore::new(dir.path()).unwrap();

        let d = bs.put(b"x").unwrap();
        let p = bs.path(&d).unwrap();
        assert!(p.ends_with(format!("sha256/{}", d.hex())));
    }
}
