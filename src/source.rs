//! The producer contract the core consumes when walking a source tree.
//!
//! This is deliberately thin: the scanning/diffing logic that decides what
//! changed between runs is an outer concern. The core only needs something
//! that yields entries in a deterministic order (parents before children)
//! and hands back a finite, once-traversable body reader per file.

use std::io;

use crate::codec::{FileType, PackedMtime};

/// What a [`SourceEntry`] names: a directory (no body, registered via
/// `add_directory`) or a file of some [`FileType`] (a body follows,
/// registered via content-id lookup and `add_file`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File(FileType),
}

/// One entry yielded by a [`SourceStream`]: a path (as byte-string
/// components, root-relative), its kind, and — for regular files — the
/// size/mtime/first-seen timestamp/body needed to register its content.
#[derive(Debug)]
pub struct SourceEntry {
    pub path: Vec<Vec<u8>>,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: PackedMtime,
    /// Seconds since the Unix epoch to record as the content registry's
    /// `first_seen` if this entry's body is new. Unused for directories.
    pub first_seen: u32,
    pub extra: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A finite, once-traversable byte stream for a single file body.
pub trait BodyReader {
    /// Read up to `max_len` bytes starting at `offset`. Returns an empty
    /// vector at EOF. Implementations may assume sequential, monotonically
    /// increasing offsets (no seeking backward).
    fn read_chunk(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>>;
}

/// Adapts any `Read` into a [`BodyReader`] for sequential, forward-only
/// consumption (the only access pattern the core requires).
pub struct SequentialBodyReader<R> {
    inner: R,
}

impl<R: io::Read> SequentialBodyReader<R> {
    pub fn new(inner: R) -> Self {
        SequentialBodyReader { inner }
    }
}

impl<R: io::Read> BodyReader for SequentialBodyReader<R> {
    fn read_chunk(&mut self, _offset: u64, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let mut total = 0;
        while total < max_len {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }
}

/// Something that can walk a source tree and yield [`SourceEntry`] values in
/// a deterministic, parents-first order, each paired with a body reader for
/// regular files.
pub trait SourceStream {
    fn next_entry(&mut self) -> io::Result<Option<(SourceEntry, Option<Box<dyn BodyReader>>)>>;
}
