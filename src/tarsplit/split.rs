use std::collections::BTreeMap;
use std::io::{Read, Write};

use crc::{Crc, CRC_64_GO_ISO};

use crate::blobstore::BlobStore;
use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::tarsplit::entry::Packer;

const BLOCK_SIZE: usize = 512;

/// CRC64 with the ISO polynomial, matching the checksum stored per file entry
pub(crate) static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// what a tar member header resolved to, after long-name and pax records
#[derive(Clone, Debug)]
pub struct TarMember {
    pub name: Vec<u8>,
    pub kind: TarMemberKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: Option<i64>,
    pub link_name: Vec<u8>,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TarMemberKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// receives each filesystem member as the splitter walks the stream
///
/// regular files come with the digest their payload was stored under.
pub trait SplitObserver {
    fn member(&mut self, member: &TarMember, digest: Option<&Digest>) -> Result<()>;
}

/// totals reported by a completed split
#[derive(Clone, Copy, Debug, Default)]
pub struct SplitSummary {
    pub members: u64,
    pub payload_bytes: u64,
}

/// overrides gathered from a pax extended header, applied to the next member
#[derive(Default)]
struct PaxOverrides {
    path: Option<Vec<u8>>,
    link_path: Option<Vec<u8>>,
    size: Option<u64>,
    mtime: Option<i64>,
    atime: Option<i64>,
    xattrs: BTreeMap<String, Vec<u8>>,
}

/// split a tar stream into packed entries plus content blobs
///
/// header blocks and every literal byte region (padding, gnu long-name and
/// pax records, the end-of-archive marker) are logged as segments; regular
/// file payloads are diverted into the blob store and logged as file
/// entries carrying (digest, size, crc64). the observer, when present,
/// sees each filesystem member with its resolved name.
pub fn disassemble<R: Read, W: Write>(
    mut input: R,
    packer: &mut Packer<W>,
    blobs: &BlobStore,
    mut observer: Option<&mut dyn SplitObserver>,
    cancel: &CancelToken,
) -> Result<SplitSummary> {
    let mut summary = SplitSummary::default();
    let mut segment: Vec<u8> = Vec::new();
    let mut pending_long_name: Option<Vec<u8>> = None;
    let mut pending_long_link: Option<Vec<u8>> = None;
    let mut pending_pax: Option<PaxOverrides> = None;

    loop {
        cancel.check()?;

        let mut block = [0u8; BLOCK_SIZE];
        let n = read_full(&mut input, &mut block)?;
        if n == 0 {
            // stream ended without an end-of-archive marker; tolerate it
            flush_segment(packer, &mut segment)?;
            break;
        }
        if n != BLOCK_SIZE {
            return Err(Error::CorruptTar("truncated header block".to_string()));
        }

        if block.iter().all(|&b| b == 0) {
            // end-of-archive: keep this block and everything after it verbatim
            segment.extend_from_slice(&block);
            input
                .read_to_end(&mut segment)
                .map_err(|e| Error::CorruptTar(format!("reading archive trailer: {e}")))?;
            flush_segment(packer, &mut segment)?;
            break;
        }

        verify_header_checksum(&block)?;

        let type_flag = block[156];
        let mut size = parse_size(&block[124..136])?;
        let pax = pending_pax.take();
        if let Some(s) = pax.as_ref().and_then(|p| p.size) {
            size = s;
        }

        match type_flag {
            b'0' | 0 => {
                let member = resolve_member(
                    &block,
                    TarMemberKind::Regular,
                    size,
                    pending_long_name.take(),
                    pending_long_link.take(),
                    pax,
                )?;

                // header goes out as a segment, payload into the blob store
                segment.extend_from_slice(&block);
                flush_segment(packer, &mut segment)?;

                let (digest, stored, crc) = put_payload(blobs, &mut input, size, cancel)?;
                if stored != size {
                    return Err(Error::CorruptTar(format!(
                        "short payload for {:?}: {} of {} bytes",
                        String::from_utf8_lossy(&member.name),
                        stored,
                        size
                    )));
                }
                packer.add_file(&member.name, size, crc, digest.clone())?;
                read_padding(&mut input, size, &mut segment)?;

                if let Some(obs) = observer.as_deref_mut() {
                    obs.member(&member, Some(&digest))?;
                }
                summary.members += 1;
                summary.payload_bytes += size;
            }
            _ => {
                segment.extend_from_slice(&block);
                let payload = read_payload_into_segment(&mut input, size, &mut segment)?;

                match type_flag {
                    b'L' => pending_long_name = Some(trim_nul(&payload)),
                    b'K' => pending_long_link = Some(trim_nul(&payload)),
                    b'x' => pending_pax = Some(parse_pax(&payload)?),
                    b'g' => {} // global records are preserved verbatim, not interpreted
                    _ => {
                        let kind = match type_flag {
                            b'5' => Some(TarMemberKind::Directory),
                            b'2' => Some(TarMemberKind::Symlink),
                            b'1' => Some(TarMemberKind::HardLink),
                            b'3' => Some(TarMemberKind::CharDevice),
                            b'4' => Some(TarMemberKind::BlockDevice),
                            b'6' => Some(TarMemberKind::Fifo),
                            _ => None,
                        };
                        if let Some(kind) = kind {
                            let member = resolve_member(
                                &block,
                                kind,
                                size,
                                pending_long_name.take(),
                                pending_long_link.take(),
                                pax,
                            )?;
                            if let Some(obs) = observer.as_deref_mut() {
                                obs.member(&member, None)?;
                            }
                            summary.members += 1;
                        }
                    }
                }
            }
        }
    }

    Ok(summary)
}

fn flush_segment<W: Write>(packer: &mut Packer<W>, segment: &mut Vec<u8>) -> Result<()> {
    if !segment.is_empty() {
        packer.add_segment(std::mem::take(segment))?;
    }
    Ok(())
}

/// stream a file payload into the blob store, counting bytes and crc64
fn put_payload<R: Read>(
    blobs: &BlobStore,
    input: &mut R,
    size: u64,
    cancel: &CancelToken,
) -> Result<(Digest, u64, u64)> {
    struct CountingReader<'a, R> {
        inner: std::io::Take<&'a mut R>,
        crc: crc::Digest<'a, u64>,
        count: u64,
        cancel: &'a CancelToken,
    }

    impl<R: Read> Read for CountingReader<'_, R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.cancel.is_cancelled() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    Error::Cancelled.to_string(),
                ));
            }
            let n = self.inner.read(buf)?;
            self.crc.update(&buf[..n]);
            self.count += n as u64;
            Ok(n)
        }
    }

    let mut reader = CountingReader {
        inner: input.take(size),
        crc: CRC64_ISO.digest(),
        count: 0,
        cancel,
    };
    let digest = match blobs.digest(&mut reader) {
        Ok(d) => d,
        Err(e) => {
            // a cancelled payload read surfaces as an io error; report the
            // cancellation itself
            cancel.check()?;
            return Err(e);
        }
    };
    let crc = reader.crc.finalize();
    Ok((digest, reader.count, crc))
}

/// copy the padding after a diverted payload into the current segment
fn read_padding<R: Read>(input: &mut R, size: u64, segment: &mut Vec<u8>) -> Result<()> {
    let padding = (BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64;
    if padding > 0 {
        let mut buf = [0u8; BLOCK_SIZE];
        let pad = &mut buf[..padding as usize];
        read_exact_or_corrupt(input, pad, "entry padding")?;
        segment.extend_from_slice(pad);
    }
    Ok(())
}

/// read a non-diverted payload (plus its padding) verbatim into the segment,
/// returning the unpadded payload bytes
fn read_payload_into_segment<R: Read>(
    input: &mut R,
    size: u64,
    segment: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    let padded = size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64;
    let mut buf = vec![0u8; padded as usize];
    read_exact_or_corrupt(input, &mut buf, "entry payload")?;
    segment.extend_from_slice(&buf);
    buf.truncate(size as usize);
    Ok(buf)
}

fn read_exact_or_corrupt<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    input
        .read_exact(buf)
        .map_err(|e| Error::CorruptTar(format!("reading {what}: {e}")))
}

/// read until the buffer is full or the stream ends; returns bytes read
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input
            .read(&mut buf[filled..])
            .map_err(|e| Error::CorruptTar(format!("reading header block: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn resolve_member(
    block: &[u8; BLOCK_SIZE],
    kind: TarMemberKind,
    size: u64,
    long_name: Option<Vec<u8>>,
    long_link: Option<Vec<u8>>,
    pax: Option<PaxOverrides>,
) -> Result<TarMember> {
    let pax = pax.unwrap_or_default();

    let name = pax
        .path
        .or(long_name)
        .unwrap_or_else(|| header_name(block));
    let link_name = pax
        .link_path
        .or(long_link)
        .unwrap_or_else(|| trim_nul(&block[157..257]));

    Ok(TarMember {
        name,
        kind,
        mode: parse_octal(&block[100..108])? as u32,
        uid: parse_octal(&block[108..116])? as u32,
        gid: parse_octal(&block[116..124])? as u32,
        size,
        mtime: pax.mtime.unwrap_or(parse_octal(&block[136..148])? as i64),
        atime: pax.atime,
        link_name,
        dev_major: parse_octal(&block[329..337])? as u32,
        dev_minor: parse_octal(&block[337..345])? as u32,
        xattrs: pax.xattrs,
    })
}

/// member name from the ustar name and prefix fields
///
/// the prefix field only exists in posix ustar headers; gnu headers reuse
/// those bytes for other fields.
fn header_name(block: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let name = trim_nul(&block[0..100]);
    if &block[257..263] == b"ustar\0" && block[345] != 0 {
        let mut full = trim_nul(&block[345..500]);
        full.push(b'/');
        full.extend_from_slice(&name);
        return full;
    }
    name
}

fn trim_nul(bytes: &[u8]) -> Vec<u8> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].to_vec()
}

/// parse an octal numeric field, tolerating leading spaces and nul/space
/// termination
fn parse_octal(field: &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                value = value
                    .checked_mul(8)
                    .and_then(|v| v.checked_add((b - b'0') as u64))
                    .ok_or_else(|| Error::CorruptTar("numeric field overflow".to_string()))?;
                seen = true;
            }
            b' ' | 0 => {
                if seen {
                    break;
                }
            }
            _ => return Err(Error::CorruptTar("invalid numeric field".to_string())),
        }
    }
    Ok(value)
}

/// parse the size field: octal, or gnu base-256 when the high bit is set
fn parse_size(field: &[u8]) -> Result<u64> {
    if field[0] & 0x80 != 0 {
        let mut value: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(b as u64))
                .ok_or_else(|| Error::CorruptTar("base-256 size overflow".to_string()))?;
        }
        return Ok(value);
    }
    parse_octal(field)
}

/// validate the stored header checksum (both unsigned and signed sums are
/// accepted, as historical writers disagree)
fn verify_header_checksum(block: &[u8; BLOCK_SIZE]) -> Result<()> {
    let stored = parse_octal(&block[148..156])?;
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in block.iter().enumerate() {
        let v = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += v as u64;
        signed += v as i8 as i64;
    }
    if stored == unsigned || stored as i64 == signed {
        Ok(())
    } else {
        Err(Error::CorruptTar("header checksum mismatch".to_string()))
    }
}

/// parse pax extended header records: `<len> <key>=<value>\n`
fn parse_pax(payload: &[u8]) -> Result<PaxOverrides> {
    let mut overrides = PaxOverrides::default();
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::CorruptTar("malformed pax record".to_string()))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::CorruptTar("malformed pax record length".to_string()))?;
        if len > rest.len() || len <= space + 1 {
            return Err(Error::CorruptTar("pax record length out of range".to_string()));
        }
        let record = &rest[space + 1..len - 1]; // drop the trailing newline
        rest = &rest[len..];

        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::CorruptTar("pax record missing '='".to_string()))?;
        let key = std::str::from_utf8(&record[..eq])
            .map_err(|_| Error::CorruptTar("pax record key not utf-8".to_string()))?;
        let value = &record[eq + 1..];

        match key {
            "path" => overrides.path = Some(value.to_vec()),
            "linkpath" => overrides.link_path = Some(value.to_vec()),
            "size" => {
                overrides.size = std::str::from_utf8(value).ok().and_then(|s| s.parse().ok())
            }
            "mtime" => overrides.mtime = parse_pax_time(value),
            "atime" => overrides.atime = parse_pax_time(value),
            _ => {
                if let Some(attr) = key.strip_prefix("SCHILY.xattr.") {
                    overrides.xattrs.insert(attr.to_string(), value.to_vec());
                }
            }
        }
    }
    Ok(overrides)
}

fn parse_pax_time(value: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(value).ok()?;
    let secs = s.split('.').next()?;
    secs.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarsplit::entry::{EntryKind, Unpacker};
    use tempfile::tempdir;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_ustar();
        header.set_path("a.txt").unwrap();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, b"hello".as_slice()).unwrap();

        let mut dir = tar::Header::new_ustar();
        dir.set_path("sub/").unwrap();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, std::io::empty()).unwrap();

        let mut header = tar::Header::new_ustar();
        header.set_path("sub/b.txt").unwrap();
        header.set_size(6);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append(&header, b"world\n".as_slice()).unwrap();

        builder.into_inner().unwrap()
    }

    struct Collecting(Vec<(Vec<u8>, TarMemberKind, Option<Digest>)>);

    impl SplitObserver for Collecting {
        fn member(&mut self, member: &TarMember, digest: Option<&Digest>) -> Result<()> {
            self.0
                .push((member.name.clone(), member.kind, digest.cloned()));
            Ok(())
        }
    }

    #[test]
    fn test_split_diverts_file_payloads() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        let tar_bytes = sample_tar();

        let mut packed = Vec::new();
        let mut packer = Packer::new(&mut packed);
        let mut obs = Collecting(Vec::new());
        let summary = disassemble(
            tar_bytes.as_slice(),
            &mut packer,
            &blobs,
            Some(&mut obs),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(summary.members, 3);
        assert_eq!(summary.payload_bytes, 11);

        // both payloads are in the blob store under their content digest
        assert!(blobs.exists(&Digest::from_bytes(b"hello")));
        assert!(blobs.exists(&Digest::from_bytes(b"world\n")));

        // observer saw all three members with resolved names
        assert_eq!(obs.0[0].0, b"a.txt");
        assert_eq!(obs.0[1].1, TarMemberKind::Directory);
        assert_eq!(obs.0[2].0, b"sub/b.txt");
        assert!(obs.0[2].2.is_some());

        // the packed stream alternates segments and file entries
        let mut unpacker = Unpacker::new(packed.as_slice());
        let kinds: Vec<EntryKind> = std::iter::from_fn(|| unpacker.next_entry().unwrap())
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EntryKind::File));
        assert_eq!(*kinds.last().unwrap(), EntryKind::Segment);
    }

    #[test]
    fn test_split_crc_matches_go_iso_table() {
        // crc64-iso of "hello" must match what the assembler recomputes
        let mut digest = CRC64_ISO.digest();
        digest.update(b"hello");
        let direct = digest.finalize();

        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        let mut packed = Vec::new();
        let mut packer = Packer::new(&mut packed);
        disassemble(
            sample_tar().as_slice(),
            &mut packer,
            &blobs,
            None,
            &CancelToken::new(),
        )
        .unwrap();

        let mut unpacker = Unpacker::new(packed.as_slice());
        let file_entry = std::iter::from_fn(|| unpacker.next_entry().unwrap())
            .find(|e| e.kind == EntryKind::File && e.name.as_deref() == Some("a.txt"))
            .unwrap();
        assert_eq!(file_entry.payload, direct.to_be_bytes().to_vec());
    }

    #[test]
    fn test_cancelled_split_fails() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        let token = CancelToken::new();
        token.cancel();

        let mut packed = Vec::new();
        let mut packer = Packer::new(&mut packed);
        let result = disassemble(
            sample_tar().as_slice(),
            &mut packer,
            &blobs,
            None,
            &token,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        let tar_bytes = sample_tar();

        let mut packed = Vec::new();
        let mut packer = Packer::new(&mut packed);
        let result = disassemble(
            &tar_bytes[..700], // cuts into the first payload's padding
            &mut packer,
            &blobs,
            None,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(Error::CorruptTar(_))));
    }

    #[test]
    fn test_octal_and_base256_sizes() {
        assert_eq!(parse_octal(b"0000644\0").unwrap(), 0o644);
        assert_eq!(parse_octal(b"        ").unwrap(), 0);

        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[10] = 0x01;
        field[11] = 0x00;
        assert_eq!(parse_size(&field).unwrap(), 256);
    }
}
