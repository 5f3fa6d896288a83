use std::path::PathBuf;

use crate::digest::{ChainId, Digest};

/// error type for strata operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("layer does not exist")]
    LayerDoesNotExist,

    #[error("RW layer with this name already exists")]
    MountNameConflict,

    #[error("RW layer does not exist")]
    MountDoesNotExist,

    #[error("max depth exceeded")]
    MaxDepthExceeded,

    #[error("layer not retained")]
    LayerNotRetained,

    #[error("cannot mount layer, mount label too large {0}")]
    MountLabelTooLarge(usize),

    #[error("driver not supported")]
    DriverNotSupported,

    #[error("backing file system is unsupported for this graph driver")]
    IncompatibleFS,

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error(
        "could not verify layer data for: {0}. This may be caused by layer metadata on disk \
         being corrupted. Re-pulling or rebuilding this image may resolve the issue"
    )]
    DigestMismatch(Digest),

    #[error("unsupported digest algorithm: {0}")]
    BlobAlgorithmUnsupported(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("layer metadata missing for {0}")]
    MissingMetadata(ChainId),

    #[error("--storage-opt is not supported for {0}")]
    StorageOptNotSupported(&'static str),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupt tar stream: {0}")]
    CorruptTar(String),

    #[error("corrupt tar-split entry: {0}")]
    CorruptEntry(String),

    #[error("tar-split checksum mismatch for {digest}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        digest: Digest,
        expected: String,
        computed: String,
    },

    #[error("invalid resource path: {0:?}")]
    InvalidResourcePath(String),

    #[error("hardlink target not found in manifest: {0}")]
    HardlinkTargetNotFound(String),

    #[error("error creating overlay mount to {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unmount {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// wrap with a context string naming the logical operation
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

/// helper to add operation context to any strata result
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
