use std::io::{BufRead, BufReader, Read, Write};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};

/// kind of packed entry
///
/// file entries stand in for a regular-file payload diverted into the
/// blob store; segment entries carry literal tar bytes (headers, padding,
/// metadata records, the end-of-archive marker).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    File,
    Segment,
}

impl Serialize for EntryKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u8(match self {
            EntryKind::File => 0,
            EntryKind::Segment => 1,
        })
    }
}

impl<'de> Deserialize<'de> for EntryKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Segment),
            other => Err(serde::de::Error::custom(format!(
                "unknown entry type {other}"
            ))),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod opt_base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// one line of the packed entry stream
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "type")]
    pub kind: EntryKind,

    /// member name, when valid utf-8
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// raw member name bytes; when present this takes precedence over `name`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64_bytes"
    )]
    pub name_raw: Option<Vec<u8>>,

    /// payload size for file entries
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    /// literal bytes for segments; 8-byte big-endian CRC64-ISO for files
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// blob store digest of the file payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,

    pub position: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Entry {
    /// the effective name; raw bytes win over the utf-8 form
    pub fn effective_name(&self) -> Option<&[u8]> {
        match (&self.name_raw, &self.name) {
            (Some(raw), _) => Some(raw),
            (None, Some(name)) => Some(name.as_bytes()),
            (None, None) => None,
        }
    }
}

/// writes entries as JSON lines, numbering positions monotonically
pub struct Packer<W: Write> {
    writer: W,
    position: u64,
}

impl<W: Write> Packer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            position: 0,
        }
    }

    /// append a segment of literal tar bytes
    pub fn add_segment(&mut self, payload: Vec<u8>) -> Result<u64> {
        self.write(Entry {
            kind: EntryKind::Segment,
            name: None,
            name_raw: None,
            size: 0,
            payload,
            digest: None,
            position: 0,
        })
    }

    /// append a file entry whose payload was stored under `digest`
    pub fn add_file(
        &mut self,
        name: &[u8],
        size: u64,
        crc: u64,
        digest: Digest,
    ) -> Result<u64> {
        let (name, name_raw) = match std::str::from_utf8(name) {
            Ok(s) => (Some(s.to_string()), None),
            Err(_) => (None, Some(name.to_vec())),
        };
        self.write(Entry {
            kind: EntryKind::File,
            name,
            name_raw,
            size,
            payload: crc.to_be_bytes().to_vec(),
            digest: Some(digest),
            position: 0,
        })
    }

    fn write(&mut self, mut entry: Entry) -> Result<u64> {
        entry.position = self.position;
        let line = serde_json::to_vec(&entry)?;
        self.writer.write_all(&line).with_path("<tar-split>")?;
        self.writer.write_all(b"\n").with_path("<tar-split>")?;
        self.position += 1;
        Ok(entry.position)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// reads entries back in stored order, checking position monotonicity
pub struct Unpacker<R: Read> {
    reader: BufReader<R>,
    next_position: u64,
}

impl<R: Read> Unpacker<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            next_position: 0,
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .with_path("<tar-split>")?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return self.next_entry();
        }
        let entry: Entry = serde_json::from_str(trimmed)?;
        if entry.position != self.next_position {
            return Err(Error::CorruptEntry(format!(
                "position {} out of order, expected {}",
                entry.position, self.next_position
            )));
        }
        self.next_position += 1;
        Ok(Some(entry))
    }
}
