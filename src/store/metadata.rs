use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::digest::{ChainId, Digest, DiffId};
use crate::error::{Error, IoResultExt, Result};
use crate::store::Descriptor;

/// file-backed metadata for layers and mounts
///
/// each layer owns a directory `sha256/<hex>/` with one small file per
/// field; mounts live under `mounts/<name>/`. writes stage into `tmp/`
/// and commit by a single rename, so a crash leaves either a complete
/// entry or none.
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: &Path) -> Result<Self> {
        for sub in ["sha256", "mounts", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn layer_dir(&self, chain_id: &ChainId) -> PathBuf {
        self.root.join("sha256").join(chain_id.digest().hex())
    }

    fn mount_dir(&self, name: &str) -> PathBuf {
        self.root.join("mounts").join(name)
    }

    pub fn start_transaction(&self) -> Result<Transaction> {
        let dir = self.tmp_dir().join(uuid::Uuid::new_v4().to_string());
        fs::create_dir(&dir).with_path(&dir)?;
        Ok(Transaction { dir })
    }

    fn read_field(&self, chain_id: &ChainId, field: &str) -> Result<String> {
        let path = self.layer_dir(chain_id).join(field);
        let contents = fs::read_to_string(&path).with_path(&path)?;
        Ok(contents.trim().to_string())
    }

    pub fn get_diff_id(&self, chain_id: &ChainId) -> Result<DiffId> {
        DiffId::parse(&self.read_field(chain_id, "diff")?)
    }

    pub fn get_size(&self, chain_id: &ChainId) -> Result<u64> {
        self.read_field(chain_id, "size")?
            .parse()
            .map_err(|_| Error::MissingMetadata(chain_id.clone()))
    }

    pub fn get_cache_id(&self, chain_id: &ChainId) -> Result<String> {
        Ok(self.read_field(chain_id, "cache-id")?)
    }

    pub fn get_tar_split(&self, chain_id: &ChainId) -> Result<Digest> {
        Digest::parse(&self.read_field(chain_id, "tar-split")?)
    }

    pub fn get_parent(&self, chain_id: &ChainId) -> Result<Option<ChainId>> {
        match self.read_field(chain_id, "parent") {
            Ok(s) if s.is_empty() => Ok(None),
            Ok(s) => Ok(Some(ChainId::parse(&s)?)),
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_descriptor(&self, chain_id: &ChainId) -> Result<Option<Descriptor>> {
        match self.read_field(chain_id, "descriptor") {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// all stored layer chain ids and mount names; malformed directory
    /// names are skipped
    pub fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)> {
        let mut chains = Vec::new();
        let layers_dir = self.root.join("sha256");
        for entry in fs::read_dir(&layers_dir).with_path(&layers_dir)? {
            let entry = entry.with_path(&layers_dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match ChainId::parse(&format!("sha256:{name}")) {
                Ok(chain) => chains.push(chain),
                Err(_) => debug!(name = %name, "skipping malformed layer metadata directory"),
            }
        }

        let mut mounts = Vec::new();
        let mounts_dir = self.root.join("mounts");
        for entry in fs::read_dir(&mounts_dir).with_path(&mounts_dir)? {
            let entry = entry.with_path(&mounts_dir)?;
            mounts.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok((chains, mounts))
    }

    pub fn remove(&self, chain_id: &ChainId) -> Result<()> {
        let dir = self.layer_dir(chain_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path: dir, source: e }),
        }
    }

    pub fn save_mount(
        &self,
        name: &str,
        mount_id: &str,
        init_id: Option<&str>,
        parent: Option<&ChainId>,
    ) -> Result<()> {
        let dir = self.mount_dir(name);
        fs::create_dir_all(&dir).with_path(&dir)?;
        fs::write(dir.join("mount-id"), mount_id).with_path(dir.join("mount-id"))?;
        if let Some(init_id) = init_id {
            fs::write(dir.join("init-id"), init_id).with_path(dir.join("init-id"))?;
        }
        if let Some(parent) = parent {
            fs::write(dir.join("parent"), parent.to_string()).with_path(dir.join("parent"))?;
        }
        Ok(())
    }

    fn read_mount_field(&self, name: &str, field: &str) -> Result<Option<String>> {
        let path = self.mount_dir(name).join(field);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    pub fn get_mount_id(&self, name: &str) -> Result<Option<String>> {
        self.read_mount_field(name, "mount-id")
    }

    pub fn get_mount_init(&self, name: &str) -> Result<Option<String>> {
        self.read_mount_field(name, "init-id")
    }

    pub fn get_mount_parent(&self, name: &str) -> Result<Option<ChainId>> {
        match self.read_mount_field(name, "parent")? {
            Some(s) => Ok(Some(ChainId::parse(&s)?)),
            None => Ok(None),
        }
    }

    pub fn remove_mount(&self, name: &str) -> Result<()> {
        let dir = self.mount_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path: dir, source: e }),
        }
    }
}

/// staged layer metadata, committed by renaming into place
pub struct Transaction {
    dir: PathBuf,
}

impl Transaction {
    fn write(&self, field: &str, contents: &str) -> Result<()> {
        let path = self.dir.join(field);
        fs::write(&path, contents).with_path(&path)
    }

    pub fn set_diff_id(&self, diff_id: &DiffId) -> Result<()> {
        self.write("diff", &diff_id.to_string())
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        self.write("size", &size.to_string())
    }

    pub fn set_cache_id(&self, cache_id: &str) -> Result<()> {
        self.write("cache-id", cache_id)
    }

    pub fn set_tar_split(&self, digest: &Digest) -> Result<()> {
        self.write("tar-split", &digest.to_string())
    }

    pub fn set_parent(&self, parent: &ChainId) -> Result<()> {
        self.write("parent", &parent.to_string())
    }

    pub fn set_descriptor(&self, descriptor: &Descriptor) -> Result<()> {
        self.write("descriptor", &serde_json::to_string(descriptor)?)
    }

    pub fn commit(self, store: &MetadataStore, chain_id: &ChainId) -> Result<()> {
        let target = store.layer_dir(chain_id);
        fs::rename(&self.dir, &target).with_path(&target)
    }

    pub fn cancel(self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
