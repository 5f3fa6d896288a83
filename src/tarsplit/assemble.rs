use std::fs::File;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::blobstore::BlobStore;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::tarsplit::entry::{Entry, EntryKind, Unpacker};
use crate::tarsplit::split::CRC64_ISO;

/// streaming reassembly of the original tar bytes from a packed entry
/// stream plus the blob store
///
/// segments are echoed verbatim; file entries are resolved through the
/// blob store and re-verified against their stored size and crc64.
pub struct Assembler<R: Read> {
    blobs: Arc<BlobStore>,
    unpacker: Unpacker<R>,
    current: Option<Source>,
}

enum Source {
    Segment(Cursor<Vec<u8>>),
    File(FileSource),
}

struct FileSource {
    reader: std::io::Take<File>,
    crc: crc::Digest<'static, u64>,
    count: u64,
    size: u64,
    expected_crc: u64,
    digest: Digest,
}

/// build an assembler over a packed entry stream
pub fn assemble<R: Read>(blobs: Arc<BlobStore>, packed: R) -> Assembler<R> {
    Assembler {
        blobs,
        unpacker: Unpacker::new(packed),
        current: None,
    }
}

impl<R: Read> Assembler<R> {
    fn advance(&mut self) -> Result<bool> {
        match self.unpacker.next_entry()? {
            None => Ok(false),
            Some(entry) => {
                self.current = Some(self.source_for(entry)?);
                Ok(true)
            }
        }
    }

    fn source_for(&self, entry: Entry) -> Result<Source> {
        match entry.kind {
            EntryKind::Segment => Ok(Source::Segment(Cursor::new(entry.payload))),
            EntryKind::File => {
                let digest = entry.digest.clone().ok_or_else(|| {
                    Error::CorruptEntry(format!(
                        "file entry at position {} has no digest",
                        entry.position
                    ))
                })?;
                let expected_crc = entry
                    .payload
                    .as_slice()
                    .try_into()
                    .map(u64::from_be_bytes)
                    .map_err(|_| {
                        Error::CorruptEntry(format!(
                            "file entry at position {} has malformed checksum",
                            entry.position
                        ))
                    })?;
                let reader = self.blobs.reader(&digest)?.take(entry.size);
                Ok(Source::File(FileSource {
                    reader,
                    crc: CRC64_ISO.digest(),
                    count: 0,
                    size: entry.size,
                    expected_crc,
                    digest,
                }))
            }
        }
    }
}

impl<R: Read> Read for Assembler<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.current.is_none() && !self.advance().map_err(into_io)? {
                return Ok(0);
            }

            match self.current.as_mut().expect("source was just set") {
                Source::Segment(cursor) => {
                    let n = cursor.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
                Source::File(src) => {
                    let n = src.reader.read(buf)?;
                    if n > 0 {
                        src.crc.update(&buf[..n]);
                        src.count += n as u64;
                        return Ok(n);
                    }
                }
            }

            // current source exhausted; files get verified before moving on
            if let Some(Source::File(src)) = self.current.take() {
                verify_file(src).map_err(into_io)?;
            }
        }
    }
}

fn verify_file(src: FileSource) -> Result<()> {
    if src.count != src.size {
        return Err(Error::CorruptEntry(format!(
            "blob {} is {} bytes, expected {}",
            src.digest, src.count, src.size
        )));
    }
    let computed = src.crc.finalize();
    if computed != src.expected_crc {
        return Err(Error::ChecksumMismatch {
            digest: src.digest,
            expected: hex::encode(src.expected_crc.to_be_bytes()),
            computed: hex::encode(computed.to_be_bytes()),
        });
    }
    Ok(())
}

fn into_io(e: Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::tarsplit::entry::Packer;
    use crate::tarsplit::split::disassemble;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_ustar();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn split(blobs: &BlobStore, tar_bytes: &[u8]) -> Vec<u8> {
        let mut packed = Vec::new();
        let mut packer = Packer::new(&mut packed);
        disassemble(tar_bytes, &mut packer, blobs, None, &CancelToken::new()).unwrap();
        packed
    }

    #[test]
    fn test_byte_exact_roundtrip() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()).unwrap());
        let original = build_tar(&[("a", b"alpha"), ("b/c", b"the quick brown fox")]);

        let packed = split(&blobs, &original);
        let mut rebuilt = Vec::new();
        assemble(blobs.clone(), packed.as_slice())
            .read_to_end(&mut rebuilt)
            .unwrap();

        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_roundtrip_empty_file() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()).unwrap());
        let original = build_tar(&[("empty", b"")]);

        let packed = split(&blobs, &original);
        let mut rebuilt = Vec::new();
        assemble(blobs.clone(), packed.as_slice())
            .read_to_end(&mut rebuilt)
            .unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_tampered_blob_fails_checksum() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()).unwrap());
        let original = build_tar(&[("f", b"payload bytes")]);
        let packed = split(&blobs, &original);

        // corrupt the stored blob in place, keeping its length
        let blob_path = blobs.path(&Digest::from_bytes(b"payload bytes")).unwrap();
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(&blob_path)
            .unwrap();
        f.write_all(b"tampered bytes").unwrap();

        let mut rebuilt = Vec::new();
        let err = assemble(blobs.clone(), packed.as_slice())
            .read_to_end(&mut rebuilt)
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_missing_blob_fails() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()).unwrap());
        let original = build_tar(&[("f", b"will vanish")]);
        let packed = split(&blobs, &original);

        std::fs::remove_file(blobs.path(&Digest::from_bytes(b"will vanish")).unwrap()).unwrap();

        let mut rebuilt = Vec::new();
        let err = assemble(blobs.clone(), packed.as_slice())
            .read_to_end(&mut rebuilt)
            .unwrap_err();
        assert!(err.to_string().contains("blob not found"));
    }
}
