use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use crate::digest::{ChainId, Digest, DiffId, VerifiedReader};
use crate::error::{Error, Result};
use crate::store::{Descriptor, GraphStoreInner, Layer};
use crate::tarsplit;

/// internal record of a committed read-only layer
///
/// `reference_count` is the strong count (children, mounts, handed-out
/// handles); `references` holds the token of every outstanding handle so
/// double releases are detectable.
pub(crate) struct RoLayer {
    pub chain_id: ChainId,
    pub diff_id: DiffId,
    pub parent: Option<ChainId>,
    pub cache_id: String,
    pub size: u64,
    pub tar_split: Digest,
    pub descriptor: Option<Descriptor>,
    pub reference_count: usize,
    pub references: HashSet<u64>,
}

impl RoLayer {
    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

/// caller-facing handle onto a read-only layer
///
/// holds no direct pointer into the layer record: every accessor resolves
/// through the store under its lock, so the retention graph has no cycle
/// through handles.
pub struct LayerRef {
    pub(crate) store: Arc<GraphStoreInner>,
    pub(crate) chain_id: ChainId,
    pub(crate) token: u64,
}

impl std::fmt::Debug for LayerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRef").field("chain_id", &self.chain_id).finish()
    }
}

impl LayerRef {
    fn with_layer<T>(&self, f: impl FnOnce(&RoLayer) -> T) -> Result<T> {
        let layers = self.store.layers.lock().expect("layer map poisoned");
        layers
            .get(&self.chain_id)
            .map(f)
            .ok_or(Error::LayerDoesNotExist)
    }
}

impl Layer for LayerRef {
    fn chain_id(&self) -> ChainId {
        self.chain_id.clone()
    }

    fn diff_id(&self) -> Result<DiffId> {
        self.with_layer(|l| l.diff_id.clone())
    }

    fn parent(&self) -> Result<Option<ChainId>> {
        self.with_layer(|l| l.parent.clone())
    }

    fn size(&self) -> Result<u64> {
        let layers = self.store.layers.lock().expect("layer map poisoned");
        let mut total = 0u64;
        let mut cursor = Some(self.chain_id.clone());
        while let Some(chain) = cursor {
            let layer = layers.get(&chain).ok_or(Error::LayerDoesNotExist)?;
            total += layer.size;
            cursor = layer.parent.clone();
        }
        Ok(total)
    }

    fn diff_size(&self) -> Result<u64> {
        self.with_layer(|l| l.size)
    }

    fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        let (tar_split, diff_id) =
            self.with_layer(|l| (l.tar_split.clone(), l.diff_id.clone()))?;
        let packed = self.store.blobs.reader(&tar_split).map_err(|e| {
            e.context("unable to get content for tar split")
        })?;
        let assembler = tarsplit::assemble(self.store.blobs.clone(), packed);
        Ok(Box::new(TarStreamReader {
            inner: VerifiedReader::new(assembler, diff_id.digest().clone()),
            diff_id,
        }))
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        let cache_id = self.with_layer(|l| l.cache_id.clone())?;
        self.store.driver.metadata(&cache_id)
    }

    fn token(&self) -> u64 {
        self.token
    }
}

/// reader wrapper attributing any data-integrity failure during assembly
/// to the layer's expected diff id
struct TarStreamReader<R> {
    inner: R,
    diff_id: DiffId,
}

impl<R: Read> Read for TarStreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "{}: {e}",
                        Error::DigestMismatch(self.diff_id.digest().clone())
                    ),
                )
            } else {
                e
            }
        })
    }
}
