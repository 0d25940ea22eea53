//! # ebakup — content-addressed backup storage engine
//!
//! Format guarantees:
//! - A storage root is a directory tree rooted at `db/main`, a block-structured
//!   descriptor naming the block size and checksum algorithm for everything
//!   beneath it; neither is renegotiated once written.
//! - Every block is self-describing and self-checking: block 0 is a textual
//!   settings block, every later block carries a trailing digest over its own
//!   zero-padded contents.
//! - File bodies are stored exactly once per distinct checksum, sharded two
//!   hex bytes deep under the storage root, named by a content-id distinct
//!   from the checksum when checksums collide.
//! - A backup snapshot is a block file recording a directory tree as of one
//!   instant; it is built under a temporary name and only becomes visible
//!   (and immutable) at `commit`, so a crash mid-backup leaves no trace once
//!   the storage root is reopened.

pub mod block;
pub mod codec;
pub mod content;
pub mod digest;
pub mod error;
pub mod lock;
pub mod snapshot;
pub mod source;
pub mod storage;

pub use content::{ContentInfo, ContentStore};
pub use digest::BlockDigest;
pub use error::EbakupError;
pub use snapshot::{Builder as SnapshotBuilder, FileInfo, SnapshotReader};
pub use source::{BodyReader, SequentialBodyReader, SourceEntry, SourceStream};
pub use storage::StorageRoot;
