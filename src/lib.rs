//! strata - layered container image storage core
//!
//! ingests tar-formatted filesystem deltas ("layers"), stacks them into
//! content-addressed chains, materialises mountable root filesystems for
//! running containers and produces tar deltas back out for distribution.
//!
//! # Core concepts
//!
//! - **DiffID**: sha256 of the uncompressed tar bytes of one layer delta
//! - **ChainID**: identity of a whole stack, `sha256(parent ++ " " ++ diff)`
//!   recursively, so equal stacks share an id regardless of how they were
//!   assembled
//! - **Tar-split**: reversible decomposition of a tar stream into a
//!   JSON-lines metadata log plus content blobs, enabling byte-exact
//!   reassembly
//! - **Whiteout**: sentinel in a diff marking a path deleted relative to
//!   its lowers; `.wh.` files on the wire, 0:0 char devices and the
//!   opaque xattr on disk
//!
//! Two interchangeable backends implement the same store contract: a
//! union-mount driver family (`overlay`, `overlay2`) and a
//! continuity-manifest store that represents each layer as a manifest
//! blob plus a tar-split blob.
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use strata::{new_layer_store, DriverRegistry};
//!
//! let registry = DriverRegistry::with_builtin();
//! let store = new_layer_store(Path::new("/var/lib/strata"), "overlay2", &[], &registry).unwrap();
//!
//! let mut tar_stream = std::fs::File::open("layer.tar").unwrap();
//! let layer = store.register(&mut tar_stream, None).unwrap();
//! println!("registered {}", layer.chain_id());
//! ```

mod blobstore;
mod cancel;
mod digest;
mod error;

pub mod archive;
pub mod continuity;
pub mod driver;
pub mod manifest;
pub mod store;
pub mod tarsplit;

pub use blobstore::BlobStore;
pub use cancel::CancelToken;
pub use digest::{chain_id_for, Algorithm, ChainId, Digest, Digester, DiffId, VerifiedReader};
pub use driver::{Driver, DriverRegistry};
pub use error::{Error, IoResultExt, Result};
pub use store::{
    CreateRwLayerOpts, Descriptor, GraphLayerStore, Layer, LayerStore, Metadata, MountInit,
    RwLayer, MAX_LAYER_DEPTH,
};

use std::path::Path;

use continuity::ContinuityStore;

/// build a layer store at `root` for the selected backend
///
/// graph-driver backends (`overlay`, `overlay2`) resolve through the
/// registry; `continuity` is its own store implementation.
pub fn new_layer_store(
    root: &Path,
    driver_name: &str,
    options: &[String],
    registry: &DriverRegistry,
) -> Result<Box<dyn LayerStore>> {
    match driver_name {
        "continuity" => Ok(Box::new(ContinuityStore::new(root)?)),
        _ => Ok(Box::new(GraphLayerStore::open(
            root,
            driver_name,
            options,
            registry,
        )?)),
    }
}
