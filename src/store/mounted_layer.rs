use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::Change;
use crate::digest::ChainId;
use crate::error::{Error, Result};
use crate::store::{GraphStoreInner, RwLayer};

/// internal record of a named read-write layer
pub(crate) struct MountedLayer {
    pub name: String,
    pub mount_id: String,
    pub init_id: Option<String>,
    pub parent: Option<ChainId>,
    /// false while the mount is still being constructed outside the lock
    pub ready: bool,
    pub references: HashSet<u64>,
}

impl MountedLayer {
    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

/// caller-facing handle onto a read-write layer
pub struct RwLayerRef {
    pub(crate) store: Arc<GraphStoreInner>,
    pub(crate) name: String,
    pub(crate) mount_id: String,
    pub(crate) token: u64,
}

impl RwLayerRef {
    /// driver id the mount's diff is taken against: the init layer when
    /// present, otherwise the parent chain's layer
    fn cache_parent(&self) -> Result<Option<String>> {
        let mounts = self.store.mounts.lock().expect("mount map poisoned");
        let mount = mounts.get(&self.name).ok_or(Error::MountDoesNotExist)?;
        if let Some(init_id) = &mount.init_id {
            return Ok(Some(init_id.clone()));
        }
        match &mount.parent {
            None => Ok(None),
            Some(parent) => {
                let layers = self.store.layers.lock().expect("layer map poisoned");
                let layer = layers.get(parent).ok_or(Error::LayerDoesNotExist)?;
                Ok(Some(layer.cache_id.clone()))
            }
        }
    }
}

impl RwLayer for RwLayerRef {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Result<Option<ChainId>> {
        let mounts = self.store.mounts.lock().expect("mount map poisoned");
        let mount = mounts.get(&self.name).ok_or(Error::MountDoesNotExist)?;
        Ok(mount.parent.clone())
    }

    fn mount(&self, mount_label: &str) -> Result<PathBuf> {
        self.store.driver.get(&self.mount_id, mount_label)
    }

    fn unmount(&self) -> Result<()> {
        self.store.driver.put(&self.mount_id)
    }

    fn size(&self) -> Result<u64> {
        let parent = self.cache_parent()?;
        self.store
            .driver
            .diff_size(&self.mount_id, parent.as_deref())
    }

    fn changes(&self) -> Result<Vec<Change>> {
        let parent = self.cache_parent()?;
        self.store.driver.changes(&self.mount_id, parent.as_deref())
    }

    fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        let parent = self.cache_parent()?;
        self.store.driver.diff(&self.mount_id, parent.as_deref())
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        let mut metadata = self.store.driver.metadata(&self.mount_id)?;
        metadata.insert("MountID".to_string(), self.mount_id.clone());
        Ok(metadata)
    }

    fn token(&self) -> u64 {
        self.token
    }
}
