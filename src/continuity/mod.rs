//! continuity-manifest storage backend
//!
//! each layer is a pair of blobs: a cbor directory manifest and a
//! tar-split log. there is no pre-materialised directory per layer; a
//! read-write mount checks out its parent manifest lazily and stacks a
//! write-capture view on top.

mod checkout;
mod write_capture;

pub use checkout::apply_manifest;
pub use write_capture::WriteCapturer;

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::archive::Change;
use crate::blobstore::BlobStore;
use crate::cancel::CancelToken;
use crate::digest::{chain_id_for, ChainId, Digest, Digester, DiffId, VerifiedReader};
use crate::error::{Error, Result, ResultExt};
use crate::manifest::{merge_aufs, Manifest, ManifestBuilder};
use crate::store::{
    CreateRwLayerOpts, Descriptor, Layer, LayerStore, Metadata, RwLayer, MAX_LAYER_DEPTH,
};
use crate::tarsplit;

const DRIVER_NAME: &str = "continuity";

struct ContLayer {
    chain_id: ChainId,
    diff_id: DiffId,
    parent: Option<ChainId>,
    size: u64,
    tar_split: Digest,
    manifest: Digest,
    descriptor: Option<Descriptor>,
    reference_count: usize,
    references: HashSet<u64>,
}

impl ContLayer {
    fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

struct ContMount {
    parent: Option<ChainId>,
    capture: Option<WriteCapturer>,
    ready: bool,
    references: HashSet<u64>,
}

impl ContMount {
    fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

struct ContinuityInner {
    blobs: Arc<BlobStore>,
    write_dir: PathBuf,
    // lock order: mounts before layers when both are needed
    layers: Mutex<HashMap<ChainId, ContLayer>>,
    mounts: Mutex<HashMap<String, ContMount>>,
    next_token: AtomicU64,
}

type ContLayerMap<'a> = MutexGuard<'a, HashMap<ChainId, ContLayer>>;

impl ContinuityInner {
    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
        let reader = self
            .blobs
            .reader(digest)
            .map_err(|e| e.context("failed to get manifest blob"))?;
        Manifest::decode_from(reader).context("failed to unmarshal manifest")
    }

    fn put_manifest(&self, manifest: &Manifest) -> Result<Digest> {
        let bytes = manifest.encode().context("failed to marshal manifest")?;
        self.blobs
            .put(&bytes)
            .map_err(|e| e.context("failed to save manifest bytes"))
    }

    fn depth_of(map: &HashMap<ChainId, ContLayer>, chain_id: &ChainId) -> usize {
        let mut depth = 0;
        let mut cursor = Some(chain_id.clone());
        while let Some(chain) = cursor {
            depth += 1;
            cursor = map.get(&chain).and_then(|l| l.parent.clone());
        }
        depth
    }

    fn cumulative_size(map: &HashMap<ChainId, ContLayer>, chain_id: &ChainId) -> u64 {
        let mut total = 0;
        let mut cursor = Some(chain_id.clone());
        while let Some(chain) = cursor {
            let layer = match map.get(&chain) {
                Some(l) => l,
                None => break,
            };
            total += layer.size;
            cursor = layer.parent.clone();
        }
        total
    }

    fn release_layer(
        &self,
        map: &mut ContLayerMap<'_>,
        chain_id: ChainId,
    ) -> Result<Vec<Metadata>> {
        let mut removed = Vec::new();
        let mut depth = 0;
        let mut chain = chain_id;

        loop {
            {
                let layer = map.get_mut(&chain).expect("released layer is in the map");
                if layer.reference_count == 0 {
                    panic!("layer not retained");
                }
                layer.reference_count -= 1;
                if layer.reference_count != 0 {
                    return Ok(removed);
                }

                if removed.is_empty() && depth > 0 {
                    panic!("cannot remove layer with child");
                }
                if layer.has_references() {
                    panic!("cannot delete referenced layer");
                }
            }

            let (diff_id, diff_size, parent) = {
                let layer = &map[&chain];
                (layer.diff_id.clone(), layer.size, layer.parent.clone())
            };
            // blobs are content-addressed and possibly shared; they stay
            let metadata = Metadata {
                chain_id: chain.clone(),
                diff_id,
                size: Self::cumulative_size(map, &chain),
                diff_size,
            };

            map.remove(&chain);
            removed.push(metadata);

            match parent {
                None => return Ok(removed),
                Some(parent) => {
                    depth += 1;
                    chain = parent;
                }
            }
        }
    }
}

/// layer store representing layers as manifest + tar-split blob pairs
pub struct ContinuityStore {
    inner: Arc<ContinuityInner>,
}

impl ContinuityStore {
    pub fn new(root: &Path) -> Result<Self> {
        let blobs = Arc::new(BlobStore::new(&root.join("blobs"))?);
        Ok(Self::with_blob_store(blobs, &root.join("write")))
    }

    /// share an existing blob store, with a separate write directory for
    /// checkouts and captures
    pub fn with_blob_store(blobs: Arc<BlobStore>, write_dir: &Path) -> Self {
        Self {
            inner: Arc::new(ContinuityInner {
                blobs,
                write_dir: write_dir.to_path_buf(),
                layers: Mutex::new(HashMap::new()),
                mounts: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    fn layer_ref(&self, chain_id: ChainId, token: u64) -> Box<dyn Layer> {
        Box::new(ContLayerRef {
            store: self.inner.clone(),
            chain_id,
            token,
        })
    }

    /// split the incoming tar into blobs, build the merged manifest and
    /// store both artefacts
    fn apply_tar(
        &self,
        reader: &mut dyn Read,
        parent_manifest: Option<Digest>,
        cancel: &CancelToken,
    ) -> Result<(DiffId, Digest, Digest, u64)> {
        struct DigestReader<'a> {
            inner: &'a mut dyn Read,
            digester: Digester,
        }
        impl Read for DigestReader<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = self.inner.read(buf)?;
                self.digester.update(&buf[..n]);
                Ok(n)
            }
        }

        let mut tee = DigestReader {
            inner: reader,
            digester: Digester::new(),
        };

        let mut builder = ManifestBuilder::new();
        let mut packed = Vec::new();
        let mut packer = tarsplit::Packer::new(&mut packed);
        let summary = tarsplit::disassemble(
            &mut tee,
            &mut packer,
            &self.inner.blobs,
            Some(&mut builder),
            cancel,
        )?;

        let diff_id = DiffId(tee.digester.finalize());
        let tar_split = self
            .inner
            .blobs
            .put(&packed)
            .context("failed to get tar split digest")?;

        let (mut manifest, _hard_links) = builder
            .build()
            .context("failed to get diff manifest")?;

        // merge on top of the parent manifest if there is one
        if let Some(parent_digest) = parent_manifest {
            let parent = self
                .inner
                .get_manifest(&parent_digest)
                .context("failed to get parent manifest")?;
            manifest = merge_aufs(&parent, &manifest);
        }

        let manifest_digest = self
            .inner
            .put_manifest(&manifest)
            .context("failed to save manifest")?;

        debug!(
            diff_id = %diff_id,
            manifest = %manifest_digest,
            size = summary.payload_bytes,
            "applied tar"
        );

        Ok((diff_id, tar_split, manifest_digest, summary.payload_bytes))
    }

    /// checkout directory for a manifest, materialising it on first use
    fn checkout(&self, manifest_digest: &Digest) -> Result<PathBuf> {
        let lower = self
            .inner
            .write_dir
            .join("checkout")
            .join(manifest_digest.algorithm().as_str())
            .join(manifest_digest.hex());
        if lower.exists() {
            return Ok(lower);
        }
        std::fs::create_dir_all(&lower).map_err(|e| Error::Io {
            path: lower.clone(),
            source: e,
        })?;

        let manifest = self
            .inner
            .get_manifest(manifest_digest)
            .context("failed to get parent manifest")?;
        apply_manifest(&lower, &manifest, &self.inner.blobs)
            .context("failed to checkout manifest")?;
        Ok(lower)
    }
}

impl LayerStore for ContinuityStore {
    fn register_with_options(
        &self,
        reader: &mut dyn Read,
        parent: Option<&ChainId>,
        descriptor: Option<Descriptor>,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Layer>> {
        let parent_manifest = match parent {
            None => None,
            Some(parent_chain) => {
                let mut layers = self.inner.layers.lock().expect("layer map poisoned");
                let Some(p) = layers.get_mut(parent_chain) else {
                    return Err(Error::LayerDoesNotExist);
                };
                p.reference_count += 1;
                let manifest = p.manifest.clone();
                if ContinuityInner::depth_of(&layers, parent_chain) >= MAX_LAYER_DEPTH {
                    self.inner
                        .release_layer(&mut layers, parent_chain.clone())?;
                    return Err(Error::MaxDepthExceeded);
                }
                Some(manifest)
            }
        };

        let applied = self.apply_tar(reader, parent_manifest, cancel);
        let (diff_id, tar_split, manifest, size) = match applied {
            Ok(v) => v,
            Err(e) => {
                if let Some(parent_chain) = parent {
                    let mut layers = self.inner.layers.lock().expect("layer map poisoned");
                    if let Err(re) = self
                        .inner
                        .release_layer(&mut layers, parent_chain.clone())
                    {
                        error!(error = %re, "failed to release parent after ingest failure");
                    }
                }
                return Err(e);
            }
        };

        let chain_id = chain_id_for(parent, &diff_id);

        let mut layers = self.inner.layers.lock().expect("layer map poisoned");
        if let Some(existing) = layers.get_mut(&chain_id) {
            // already registered: the fresh blobs are content-addressed
            // duplicates, nothing to clean up
            existing.reference_count += 1;
            let token = self.inner.next_token();
            existing.references.insert(token);
            if let Some(parent_chain) = parent {
                self.inner
                    .release_layer(&mut layers, parent_chain.clone())?;
            }
            return Ok(self.layer_ref(chain_id, token));
        }

        let token = self.inner.next_token();
        layers.insert(
            chain_id.clone(),
            ContLayer {
                chain_id: chain_id.clone(),
                diff_id,
                parent: parent.cloned(),
                size,
                tar_split,
                manifest,
                descriptor,
                reference_count: 1,
                references: HashSet::from([token]),
            },
        );

        Ok(self.layer_ref(chain_id, token))
    }

    fn get(&self, chain_id: &ChainId) -> Result<Box<dyn Layer>> {
        let mut layers = self.inner.layers.lock().expect("layer map poisoned");
        let Some(layer) = layers.get_mut(chain_id) else {
            return Err(Error::LayerDoesNotExist);
        };
        layer.reference_count += 1;
        let token = self.inner.next_token();
        layer.references.insert(token);
        Ok(self.layer_ref(chain_id.clone(), token))
    }

    fn release(&self, layer: Box<dyn Layer>) -> Result<Vec<Metadata>> {
        let mut layers = self.inner.layers.lock().expect("layer map poisoned");
        let chain_id = layer.chain_id();
        let Some(rl) = layers.get_mut(&chain_id) else {
            return Ok(Vec::new());
        };
        if !rl.references.remove(&layer.token()) {
            return Err(Error::LayerNotRetained);
        }
        self.inner.release_layer(&mut layers, chain_id)
    }

    fn map(&self) -> HashMap<ChainId, Box<dyn Layer>> {
        let layers = self.inner.layers.lock().expect("layer map poisoned");
        layers
            .keys()
            .map(|chain| (chain.clone(), self.layer_ref(chain.clone(), 0)))
            .collect()
    }

    fn create_rw_layer(
        &self,
        name: &str,
        parent: Option<&ChainId>,
        opts: CreateRwLayerOpts,
    ) -> Result<Box<dyn RwLayer>> {
        {
            let mut mounts = self.inner.mounts.lock().expect("mount map poisoned");
            if mounts.contains_key(name) {
                return Err(Error::MountNameConflict);
            }
            mounts.insert(
                name.to_string(),
                ContMount {
                    parent: None,
                    capture: None,
                    ready: false,
                    references: HashSet::new(),
                },
            );
        }

        let unreserve = |store: &Self| {
            store
                .inner
                .mounts
                .lock()
                .expect("mount map poisoned")
                .remove(name);
        };

        let parent_manifest = match parent {
            None => None,
            Some(parent_chain) => {
                let mut layers = self.inner.layers.lock().expect("layer map poisoned");
                let Some(p) = layers.get_mut(parent_chain) else {
                    unreserve(self);
                    return Err(Error::LayerDoesNotExist);
                };
                p.reference_count += 1;
                Some(p.manifest.clone())
            }
        };

        let built = (|| -> Result<WriteCapturer> {
            let lower = match &parent_manifest {
                None => None,
                Some(manifest_digest) => Some(self.checkout(manifest_digest)?),
            };

            let capture = WriteCapturer::new(
                &self.inner.write_dir.join("capture").join(name),
                lower,
            )
            .context("unable to create write capture layer")?;

            if let Some(init_func) = &opts.init_func {
                capture
                    .init(init_func.as_ref(), &opts.mount_label)
                    .context("failed to initialize write capture layer")?;
            }
            Ok(capture)
        })();

        match built {
            Ok(capture) => {
                let mut mounts = self.inner.mounts.lock().expect("mount map poisoned");
                let mount = mounts.get_mut(name).expect("reserved mount present");
                mount.parent = parent.cloned();
                mount.capture = Some(capture);
                mount.ready = true;
                let token = self.inner.next_token();
                mount.references.insert(token);
                Ok(Box::new(ContMountRef {
                    store: self.inner.clone(),
                    name: name.to_string(),
                    token,
                }))
            }
            Err(e) => {
                unreserve(self);
                if let Some(parent_chain) = parent {
                    let mut layers = self.inner.layers.lock().expect("layer map poisoned");
                    if let Err(re) = self
                        .inner
                        .release_layer(&mut layers, parent_chain.clone())
                    {
                        error!(error = %re, "failed to release parent after mount failure");
                    }
                }
                Err(e)
            }
        }
    }

    fn get_rw_layer(&self, name: &str) -> Result<Box<dyn RwLayer>> {
        let mut mounts = self.inner.mounts.lock().expect("mount map poisoned");
        let Some(mount) = mounts.get_mut(name) else {
            return Err(Error::MountDoesNotExist);
        };
        if !mount.ready {
            return Err(Error::MountDoesNotExist);
        }
        let token = self.inner.next_token();
        mount.references.insert(token);
        Ok(Box::new(ContMountRef {
            store: self.inner.clone(),
            name: name.to_string(),
            token,
        }))
    }

    fn get_mount_id(&self, name: &str) -> Result<String> {
        let mounts = self.inner.mounts.lock().expect("mount map poisoned");
        if !mounts.contains_key(name) {
            return Err(Error::MountDoesNotExist);
        }
        debug!(name, "resolved mount id");
        Ok(name.to_string())
    }

    fn release_rw_layer(&self, rw: Box<dyn RwLayer>) -> Result<Vec<Metadata>> {
        let mut mounts = self.inner.mounts.lock().expect("mount map poisoned");
        let Some(mount) = mounts.get_mut(rw.name()) else {
            return Ok(Vec::new());
        };
        if !mount.references.remove(&rw.token()) {
            return Err(Error::LayerNotRetained);
        }
        if mount.has_references() {
            return Ok(Vec::new());
        }

        if let Some(capture) = &mount.capture {
            if let Err(e) = capture.destroy() {
                error!(mount = rw.name(), error = %e, "error removing write capture");
                mount.references.insert(rw.token());
                return Err(e);
            }
        }

        let parent = mount.parent.clone();
        mounts.remove(rw.name());

        match parent {
            None => Ok(Vec::new()),
            Some(parent) => {
                let mut layers = self.inner.layers.lock().expect("layer map poisoned");
                self.inner.release_layer(&mut layers, parent)
            }
        }
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn driver_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn driver_status(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// handle onto a continuity read-only layer
struct ContLayerRef {
    store: Arc<ContinuityInner>,
    chain_id: ChainId,
    token: u64,
}

impl std::fmt::Debug for ContLayerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContLayerRef").field("chain_id", &self.chain_id).finish()
    }
}

impl ContLayerRef {
    fn with_layer<T>(&self, f: impl FnOnce(&ContLayer) -> T) -> Result<T> {
        let layers = self.store.layers.lock().expect("layer map poisoned");
        layers
            .get(&self.chain_id)
            .map(f)
            .ok_or(Error::LayerDoesNotExist)
    }
}

impl Layer for ContLayerRef {
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
        Ok(ContinuityInner::cumulative_size(&layers, &self.chain_id))
    }

    fn diff_size(&self) -> Result<u64> {
        self.with_layer(|l| l.size)
    }

    fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        let (tar_split, diff_id) =
            self.with_layer(|l| (l.tar_split.clone(), l.diff_id.clone()))?;
        let packed = self
            .store
            .blobs
            .reader(&tar_split)
            .map_err(|e| e.context("unable to get content for tar split"))?;
        let assembler = tarsplit::assemble(self.store.blobs.clone(), packed);
        Ok(Box::new(VerifiedReader::new(
            assembler,
            diff_id.digest().clone(),
        )))
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        self.with_layer(|l| {
            let mut metadata = HashMap::new();
            metadata.insert("manifest".to_string(), l.manifest.to_string());
            metadata.insert("tar-split".to_string(), l.tar_split.to_string());
            metadata
        })
    }

    fn token(&self) -> u64 {
        self.token
    }
}

/// handle onto a continuity read-write layer
///
/// the mount surface is not wired to the write capturer here; those
/// operations report a typed unsupported error rather than inventing a
/// fallback.
struct ContMountRef {
    store: Arc<ContinuityInner>,
    name: String,
    token: u64,
}

impl RwLayer for ContMountRef {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Result<Option<ChainId>> {
        let mounts = self.store.mounts.lock().expect("mount map poisoned");
        let mount = mounts.get(&self.name).ok_or(Error::MountDoesNotExist)?;
        Ok(mount.parent.clone())
    }

    fn mount(&self, _mount_label: &str) -> Result<PathBuf> {
        Err(Error::Unsupported("continuity rw layer mount"))
    }

    fn unmount(&self) -> Result<()> {
        Err(Error::Unsupported("continuity rw layer unmount"))
    }

    fn size(&self) -> Result<u64> {
        Err(Error::Unsupported("continuity rw layer size"))
    }

    fn changes(&self) -> Result<Vec<Change>> {
        Err(Error::Unsupported("continuity rw layer changes"))
    }

    fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        Err(Error::Unsupported("continuity rw layer tar stream"))
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        Err(Error::Unsupported("continuity rw layer metadata"))
    }

    fn token(&self) -> u64 {
        self.token
    }
}
