use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// digest algorithm tag
///
/// sha256 is the canonical algorithm; everything content-addressed in the
/// store is keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// an algorithm-tagged content digest, rendered as `sha256:<hex>`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// digest of a byte slice with the canonical algorithm
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// parse from the `algo:hex` form
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hx) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(s.to_string()))?;
        if algo != "sha256" {
            return Err(Error::BlobAlgorithmUnsupported(algo.to_string()));
        }
        if hx.len() != 64 || !hx.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(s.to_string()));
        }
        Ok(Self {
            algorithm: Algorithm::Sha256,
            hex: hx.to_ascii_lowercase(),
        })
    }

    pub fn from_sha256_hex(hx: impl Into<String>) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hx.into(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}:{})", self.algorithm, &self.hex[..12.min(self.hex.len())])
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// digest of the uncompressed tar bytes of one layer delta
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct DiffId(pub Digest);

impl DiffId {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(Digest::parse(s)?))
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Digest> for DiffId {
    fn from(d: Digest) -> Self {
        Self(d)
    }
}

/// digest identifying a whole stack of layers, bottom-up
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct ChainId(pub Digest);

impl ChainId {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(Digest::parse(s)?))
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Digest> for ChainId {
    fn from(d: Digest) -> Self {
        Self(d)
    }
}

/// chain identity for a diff applied on a parent chain
///
/// with no parent the chain id is the diff id itself; otherwise it is
/// `sha256(parent ++ " " ++ diff)` over the rendered digest strings.
pub fn chain_id_for(parent: Option<&ChainId>, diff: &DiffId) -> ChainId {
    match parent {
        None => ChainId(diff.0.clone()),
        Some(p) => {
            let combined = format!("{} {}", p, diff);
            ChainId(Digest::from_bytes(combined.as_bytes()))
        }
    }
}

/// streaming sha256 digester
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

/// reader that hashes everything passing through and verifies the digest
/// once the underlying stream is exhausted
pub struct VerifiedReader<R> {
    inner: R,
    hasher: Option<Sha256>,
    expected: Digest,
}

impl<R: Read> VerifiedReader<R> {
    pub fn new(inner: R, expected: Digest) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected,
        }
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&buf[..n]);
            }
        } else if let Some(h) = self.hasher.take() {
            let computed = hex::encode(h.finalize());
            if computed != self.expected.hex() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    Error::DigestMismatch(self.expected.clone()).to_string(),
                ));
            }
        }
        Ok(n)
    }
}
