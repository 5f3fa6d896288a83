//! reversible decomposition of a tar stream into a metadata log plus
//! content blobs
//!
//! a tar stream is split into two artefacts so the original bytes can be
//! reconstructed exactly:
//!
//! - a packed entry stream: a JSON-lines log of every tar member header
//!   and every literal inter-entry byte region, numbered monotonically
//! - file-content blobs: regular-file payloads keyed by content digest in
//!   the blob store
//!
//! the splitter works at the 512-byte block level rather than through a
//! tar library, because the literal regions (padding, long-name records,
//! end-of-archive blocks) must survive byte for byte.

mod assemble;
mod entry;
mod split;

pub use assemble::{assemble, Assembler};
pub use entry::{Entry, EntryKind, Packer, Unpacker};
pub use split::{disassemble, SplitObserver, SplitSummary, TarMember, TarMemberKind};
