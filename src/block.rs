//! Block-structured file abstraction: fixed-size blocks, per-block checksum,
//! append, exclusive/shared locking, atomic rename-on-commit.
//!
//! # On-disk layout
//! Block 0 is the **settings block**: a magic line, then `key:value\n`
//! lines, zero-padded to `block_size - digest_len`, followed by
//! `digest(content)`. Blocks 1+ are **data blocks**: a dense sequence of
//! encoded items (see `crate::codec`), terminated by the first `0x00` byte
//! (mandatory zero padding to block end), followed by `digest(content)`.
//!
//! This generalizes `sixcy::block`'s "serialize → checksum → payload"
//! pattern: instead of one 84-byte header per compressed chunk, many small
//! items are packed densely into a block and the whole block is checksummed,
//! not a per-item header.
//!
//! # Settings block lifetime
//! The settings block is *finalized* (padded, checksummed, and written) by
//! an explicit call, not automatically at block-0's first write. `main` and
//! `content` finalize immediately after `create`; a backup builder defers
//! finalization until `commit`, so it can add the `end` setting after every
//! item has been appended to the data blocks that follow it.
//!
//! # Recovery
//! `open_rw_repairing` repairs a trailing data block whose checksum does not
//! verify by truncating it away — the "crash mid-append" recovery rule,
//! which applies only to a snapshot builder still under its temporary name.
//! `open_rw` is the plain reopen used for everything already committed (the
//! content registry, in particular): a bad trailing block there is a hard
//! `Integrity` failure, same as a corrupt settings block always is.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::codec::Item;
use crate::digest::BlockDigest;
use crate::error::BlockFileError;
use crate::lock::ScopedLock;

pub const MAGIC_MAIN: &[u8] = b"ebakup database v1";
pub const MAGIC_CONTENT: &[u8] = b"ebakup content data";
pub const MAGIC_BACKUP: &[u8] = b"ebakup backup data";

pub const SETTING_BLOCKSIZE: &str = "edb-blocksize";
pub const SETTING_BLOCKSUM: &str = "edb-blocksum";

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

fn write_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)
}

fn fsync_parent_dir(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(dirf) = File::open(dir) {
            let _ = dirf.sync_all();
        }
    }
}

// ── Settings block ───────────────────────────────────────────────────────────

/// The parsed, verified contents of block 0: a magic line plus an ordered
/// list of `key:value` settings (including `edb-blocksize`/`edb-blocksum`,
/// which are also pulled out for convenience).
#[derive(Debug, Clone)]
pub struct SettingsBlock {
    pub magic: Vec<u8>,
    pub block_size: usize,
    pub digest: BlockDigest,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SettingsBlock {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key.as_bytes())
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }
}

/// Scan enough of the file to find `edb-blocksize`/`edb-blocksum` without
/// yet knowing the block size. These two settings are conventionally written
/// right after the magic line, so a bounded prefix read is always enough in
/// practice; this pass does not verify the checksum.
fn bootstrap_block_size_digest(file: &File) -> Result<(usize, BlockDigest), BlockFileError> {
    let file_len = file.metadata()?.len();
    let probe_len = file_len.min(1 << 20) as usize;
    let mut buf = vec![0u8; probe_len];
    read_at(file, 0, &mut buf)?;

    let mut pos = 0usize;
    let mut block_size = None;
    let mut digest = None;
    let mut first = true;
    while pos < buf.len() && buf[pos] != 0 {
        let nl = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(o) => o,
            None => break,
        };
        let line = &buf[pos..pos + nl];
        pos += nl + 1;
        if first {
            first = false;
            continue;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let key = &line[..colon];
            let value = &line[colon + 1..];
            if key == SETTING_BLOCKSIZE.as_bytes() {
                block_size = std::str::from_utf8(value).ok().and_then(|s| s.parse().ok());
            } else if key == SETTING_BLOCKSUM.as_bytes() {
                digest = std::str::from_utf8(value)
                    .ok()
                    .and_then(BlockDigest::from_name);
            }
        }
        if block_size.is_some() && digest.is_some() {
            break;
        }
    }
    let block_size =
        block_size.ok_or_else(|| BlockFileError::Format("missing edb-blocksize setting".into()))?;
    let digest =
        digest.ok_or_else(|| BlockFileError::Format("missing edb-blocksum setting".into()))?;
    Ok((block_size, digest))
}

fn parse_and_verify_block0(file: &File) -> Result<SettingsBlock, BlockFileError> {
    let (block_size, digest) = bootstrap_block_size_digest(file)?;
    let digest_len = digest.output_len();
    if digest_len >= block_size {
        return Err(BlockFileError::Format(
            "block_size too small for the digest algorithm".into(),
        ));
    }
    let capacity = block_size - digest_len;

    let mut raw = vec![0u8; block_size];
    read_at(file, 0, &mut raw)?;
    let (content, checksum) = raw.split_at(capacity);
    if digest.digest(content) != checksum {
        return Err(BlockFileError::Integrity);
    }

    let term = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    if content[term..].iter().any(|&b| b != 0) {
        return Err(BlockFileError::Integrity);
    }

    let used = &content[..term];
    let mut lines = Vec::new();
    let mut pos = 0usize;
    while pos < used.len() {
        let nl = used[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| BlockFileError::Format("unterminated settings line".into()))?;
        lines.push(&used[pos..pos + nl]);
        pos += nl + 1;
    }
    if lines.is_empty() {
        return Err(BlockFileError::Format("missing magic line".into()));
    }
    let magic = lines[0].to_vec();
    let mut entries = Vec::with_capacity(lines.len() - 1);
    for line in &lines[1..] {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| BlockFileError::Format("setting line missing ':'".into()))?;
        entries.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
    }
    Ok(SettingsBlock {
        magic,
        block_size,
        digest,
        entries,
    })
}

// ── BlockFile (writer/append session) ───────────────────────────────────────

pub struct BlockFile {
    lock: ScopedLock,
    path: PathBuf,
    settings: SettingsBlock,
    settings_finalized: bool,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    next_block_index: u64,
    current: Vec<u8>,
    capacity: usize,
}

impl BlockFile {
    pub fn block_size(&self) -> usize {
        self.settings.block_size
    }

    pub fn digest(&self) -> BlockDigest {
        self.settings.digest
    }

    pub fn settings(&self) -> &SettingsBlock {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a new block file. Fails `AlreadyExists` if `path` is present.
    /// The settings block starts open; call `append_setting` then
    /// `finalize_settings` (immediately, or — for a backup builder — only
    /// at commit time, after data items have been appended).
    pub fn create(
        path: &Path,
        block_size: usize,
        digest: BlockDigest,
        magic: &[u8],
    ) -> Result<BlockFile, BlockFileError> {
        let digest_len = digest.output_len();
        if digest_len >= block_size {
            return Err(BlockFileError::Format(
                "block_size too small for the digest algorithm".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => BlockFileError::AlreadyExists,
                _ => BlockFileError::Io(e),
            })?;
        let lock = ScopedLock::acquire_exclusive(file)?;
        debug!("created block file {}", path.display());
        Ok(BlockFile {
            lock,
            path: path.to_path_buf(),
            settings: SettingsBlock {
                magic: magic.to_vec(),
                block_size,
                digest,
                entries: Vec::new(),
            },
            settings_finalized: false,
            pending: Vec::new(),
            next_block_index: 1,
            current: Vec::new(),
            capacity: block_size - digest_len,
        })
    }

    /// Reopen an existing, committed block file for appending. Never
    /// repairs: a trailing data block with an invalid checksum is a hard
    /// `Integrity` failure, matching the rule that committed files are
    /// never auto-repaired. This is what the content registry (a
    /// long-lived, always-committed file) opens through.
    pub fn open_rw(path: &Path) -> Result<BlockFile, BlockFileError> {
        Self::open_rw_impl(path, false)
    }

    /// Reopen a block file still under its temporary (uncommitted) name,
    /// repairing a trailing data block with an invalid checksum by
    /// truncating it away — the "crash mid-append" recovery rule, which
    /// applies only while a snapshot builder has not yet been committed.
    pub fn open_rw_repairing(path: &Path) -> Result<BlockFile, BlockFileError> {
        Self::open_rw_impl(path, true)
    }

    fn open_rw_impl(path: &Path, repair: bool) -> Result<BlockFile, BlockFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BlockFileError::NotFound,
                _ => BlockFileError::Io(e),
            })?;
        let lock = ScopedLock::acquire_exclusive(file)?;
        let settings = parse_and_verify_block0(&lock)?;
        let block_size = settings.block_size as u64;
        let capacity = settings.block_size - settings.digest.output_len();

        let file_len = lock.metadata()?.len();
        if file_len < block_size {
            return Err(BlockFileError::Format("file shorter than one block".into()));
        }
        let remainder = (file_len - block_size) % block_size;
        let mut file_len = file_len - remainder;
        if remainder != 0 {
            if !repair {
                return Err(BlockFileError::Integrity);
            }
            lock.set_len(file_len)?;
        }

        let mut next_block_index = file_len / block_size;
        if next_block_index > 1 {
            let last = next_block_index - 1;
            let mut raw = vec![0u8; settings.block_size];
            read_at(&lock, last * block_size, &mut raw)?;
            let (content, checksum) = raw.split_at(capacity);
            if settings.digest.digest(content) != checksum {
                if !repair {
                    return Err(BlockFileError::Integrity);
                }
                warn!(
                    "repairing {}: trailing block {} has an invalid checksum, truncating",
                    path.display(),
                    last
                );
                file_len = last * block_size;
                lock.set_len(file_len)?;
                next_block_index = last;
            }
        }

        Ok(BlockFile {
            lock,
            path: path.to_path_buf(),
            settings,
            settings_finalized: true,
            pending: Vec::new(),
            next_block_index: next_block_index.max(1),
            current: Vec::new(),
            capacity,
        })
    }

    /// Stage a settings-block entry. Only legal before `finalize_settings`.
    pub fn append_setting(&mut self, key: &str, value: &[u8]) -> Result<(), BlockFileError> {
        if self.settings_finalized {
            return Err(BlockFileError::Format(
                "settings block already finalized".into(),
            ));
        }
        if key.as_bytes().contains(&b'\n')
            || key.as_bytes().contains(&b':')
            || value.contains(&b'\n')
        {
            return Err(BlockFileError::Format(
                "setting key/value contains ':' or LF".into(),
            ));
        }
        self.pending.push((key.as_bytes().to_vec(), value.to_vec()));
        Ok(())
    }

    /// Pad, checksum, and write block 0. Idempotent once finalized.
    pub fn finalize_settings(&mut self) -> Result<(), BlockFileError> {
        if self.settings_finalized {
            return Ok(());
        }
        let mut content = Vec::with_capacity(self.settings.block_size);
        content.extend_from_slice(&self.settings.magic);
        content.push(b'\n');
        for (k, v) in &self.pending {
            content.extend_from_slice(k);
            content.push(b':');
            content.extend_from_slice(v);
            content.push(b'\n');
        }
        if content.len() > self.capacity {
            return Err(BlockFileError::TooLarge {
                len: content.len(),
                available: self.capacity,
            });
        }
        content.resize(self.capacity, 0);
        let checksum = self.settings.digest.digest(&content);
        write_at(&self.lock, 0, &content)?;
        write_at(&self.lock, self.capacity as u64, &checksum)?;
        self.lock.sync_all()?;
        self.settings.entries = std::mem::take(&mut self.pending);
        self.settings_finalized = true;
        trace!("finalized settings block for {}", self.path.display());
        Ok(())
    }

    /// Encode and append one data item. If it does not fit in the current
    /// tail block, that block is sealed (padded, checksummed, written) and a
    /// new one is started. Items larger than one block's capacity fail
    /// `TooLarge`.
    pub fn append_item(&mut self, item: &Item) -> Result<(), BlockFileError> {
        let encoded = item.encode();
        if encoded.len() > self.capacity {
            return Err(BlockFileError::TooLarge {
                len: encoded.len(),
                available: self.capacity,
            });
        }
        if self.current.len() + encoded.len() > self.capacity {
            self.flush_tail()?;
            self.next_block_index += 1;
            self.current.clear();
        }
        self.current.extend_from_slice(&encoded);
        Ok(())
    }

    /// Write the in-progress tail block's content plus a freshly computed
    /// checksum. Does not advance past this block — more items may still be
    /// appended into it, in which case the next `flush_tail`/`sync` call
    /// simply rewrites it with the larger content.
    fn flush_tail(&mut self) -> Result<(), BlockFileError> {
        let mut block = self.current.clone();
        block.resize(self.capacity, 0);
        let checksum = self.settings.digest.digest(&block);
        let offset = self.next_block_index * self.settings.block_size as u64;
        write_at(&self.lock, offset, &block)?;
        write_at(&self.lock, offset + self.capacity as u64, &checksum)?;
        Ok(())
    }

    /// Durably persist whatever has been appended to the tail block without
    /// closing the file. Used by the content registry, which fsyncs after
    /// every `add_content`.
    pub fn sync(&mut self) -> Result<(), BlockFileError> {
        if !self.current.is_empty() {
            self.flush_tail()?;
        }
        self.lock.sync_all()?;
        Ok(())
    }

    /// Replay every item across all sealed data blocks (and the in-progress
    /// tail, if any), for callers that rebuild an in-memory index at open.
    /// Legacy item tags that decode to `None` are skipped, not returned.
    pub fn replay(&self) -> Result<Vec<Item>, BlockFileError> {
        let mut items = Vec::new();
        for idx in 1..self.next_block_index {
            let mut raw = vec![0u8; self.settings.block_size];
            read_at(&self.lock, idx * self.settings.block_size as u64, &mut raw)?;
            let (content, checksum) = raw.split_at(self.capacity);
            if self.settings.digest.digest(content) != checksum {
                return Err(BlockFileError::Integrity);
            }
            decode_items_from_content(content, &mut items)?;
        }
        if !self.current.is_empty() {
            decode_items_from_content(&self.current, &mut items)?;
        }
        Ok(items)
    }

    /// Finalize any pending settings/tail block, fsync the file and its
    /// containing directory, and release the lock.
    pub fn close(mut self) -> Result<(), BlockFileError> {
        if !self.settings_finalized {
            self.finalize_settings()?;
        }
        if !self.current.is_empty() {
            self.flush_tail()?;
        }
        self.lock.sync_all()?;
        fsync_parent_dir(&self.path);
        debug!("closed block file {}", self.path.display());
        Ok(())
    }
}

fn decode_items_from_content(content: &[u8], out: &mut Vec<Item>) -> Result<(), BlockFileError> {
    let term = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    let mut pos = 0usize;
    let used = &content[..term];
    while pos < used.len() {
        let (maybe_item, consumed) = Item::decode(&used[pos..])?;
        pos += consumed;
        if let Some(item) = maybe_item {
            out.push(item);
        } else {
            warn!("skipping legacy content-record item variant during replay");
        }
    }
    Ok(())
}

// ── Read-only iteration ──────────────────────────────────────────────────────

/// Pull-style iterator over a block file's data items. Owns the file handle
/// (under a shared lock) and buffers one block's content at a time.
pub struct ItemIter {
    lock: ScopedLock,
    block_size: u64,
    capacity: usize,
    digest: BlockDigest,
    next_block_index: u64,
    total_blocks: u64,
    buffer: Vec<u8>,
    buf_pos: usize,
    done: bool,
}

impl ItemIter {
    fn load_next_block(&mut self) -> Result<(), BlockFileError> {
        let mut raw = vec![0u8; self.block_size as usize];
        read_at(&self.lock, self.next_block_index * self.block_size, &mut raw)?;
        self.next_block_index += 1;
        let (content, checksum) = raw.split_at(self.capacity);
        if self.digest.digest(content) != checksum {
            return Err(BlockFileError::Integrity);
        }
        let term = content.iter().position(|&b| b == 0).unwrap_or(content.len());
        self.buffer = content[..term].to_vec();
        self.buf_pos = 0;
        Ok(())
    }
}

impl Iterator for ItemIter {
    type Item = Result<Item, BlockFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buf_pos < self.buffer.len() {
                match Item::decode(&self.buffer[self.buf_pos..]) {
                    Ok((maybe_item, consumed)) => {
                        self.buf_pos += consumed;
                        match maybe_item {
                            Some(item) => return Some(Ok(item)),
                            None => continue,
                        }
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
            }
            if self.done || self.next_block_index >= self.total_blocks {
                return None;
            }
            if let Err(e) = self.load_next_block() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Open a block file read-only, returning its verified settings plus a
/// streaming iterator over its data items.
pub fn open_ro(path: &Path) -> Result<(SettingsBlock, ItemIter), BlockFileError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BlockFileError::NotFound,
        _ => BlockFileError::Io(e),
    })?;
    let lock = ScopedLock::acquire_shared(file)?;
    let settings = parse_and_verify_block0(&lock)?;
    let capacity = settings.block_size - settings.digest.output_len();
    let file_len = lock.metadata()?.len();
    let total_blocks = file_len / settings.block_size as u64;
    let iter = ItemIter {
        lock,
        block_size: settings.block_size as u64,
        capacity,
        digest: settings.digest,
        next_block_index: 1,
        total_blocks,
        buffer: Vec::new(),
        buf_pos: 0,
        done: false,
    };
    Ok((settings, iter))
}

/// Atomically publish `src` as `dst`, then fsync the containing directory.
pub fn rename_and_overwrite(src: &Path, dst: &Path) -> Result<(), BlockFileError> {
    std::fs::rename(src, dst)?;
    fsync_parent_dir(dst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FileType;

    fn open_settings(path: &Path) -> (SettingsBlock, ItemIter) {
        open_ro(path).unwrap()
    }

    #[test]
    fn create_and_reopen_empty_main_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main");
        let mut bf =
            BlockFile::create(&path, DEFAULT_BLOCK_SIZE, BlockDigest::Sha256, MAGIC_MAIN).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"4096").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"sha256").unwrap();
        bf.append_setting("checksum", b"sha256").unwrap();
        bf.finalize_settings().unwrap();
        bf.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), DEFAULT_BLOCK_SIZE);
        assert!(bytes.starts_with(b"ebakup database v1\n"));

        let (settings, mut items) = open_settings(&path);
        assert_eq!(settings.block_size, 4096);
        assert_eq!(settings.digest, BlockDigest::Sha256);
        assert_eq!(settings.get_str("checksum"), Some("sha256"));
        assert!(items.next().is_none());
    }

    #[test]
    fn scenario_1_main_file_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main");
        let mut bf =
            BlockFile::create(&path, DEFAULT_BLOCK_SIZE, BlockDigest::Sha256, MAGIC_MAIN).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"4096").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"sha256").unwrap();
        bf.append_setting("checksum", b"sha256").unwrap();
        bf.finalize_settings().unwrap();
        bf.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4096);
        let content = &bytes[..4064];
        let checksum = &bytes[4064..];
        use sha2::{Digest, Sha256};
        let mut h = Sha256::new();
        h.update(content);
        assert_eq!(h.finalize().as_slice(), checksum);
        assert!(content.starts_with(b"ebakup database v1\nedb-blocksize:4096\nedb-blocksum:sha256\nchecksum:sha256\n"));
        assert!(content[content.iter().position(|&b| b == 0).unwrap()..]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn scenario_4_checksum_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main");
        let mut bf =
            BlockFile::create(&path, DEFAULT_BLOCK_SIZE, BlockDigest::Sha256, MAGIC_MAIN).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"4096").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"sha256").unwrap();
        bf.finalize_settings().unwrap();
        bf.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 3] ^= 0xff;
        bytes[len - 2] ^= 0xff;
        bytes[len - 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = open_ro(&path).unwrap_err();
        assert!(matches!(err, BlockFileError::Integrity));
    }

    #[test]
    fn append_item_rolls_over_full_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        // A tiny block size forces multiple rollovers quickly.
        let mut bf = BlockFile::create(&path, 64, BlockDigest::Md5, MAGIC_CONTENT).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"64").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"md5").unwrap();
        bf.finalize_settings().unwrap();

        for i in 0u8..20 {
            let item = crate::codec::Item::Content {
                cid: vec![i; 4],
                checksum: vec![i; 4],
                first_seen: 1000 + i as u32,
            };
            bf.append_item(&item).unwrap();
        }
        bf.close().unwrap();

        let (_settings, iter) = open_settings(&path);
        let items: Vec<_> = iter.map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 20);
    }

    #[test]
    fn oversized_item_is_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup");
        let mut bf = BlockFile::create(&path, 32, BlockDigest::Md5, MAGIC_BACKUP).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"32").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"md5").unwrap();
        bf.finalize_settings().unwrap();

        let item = crate::codec::Item::File {
            filetype: FileType::Regular,
            parent: 0,
            name: b"a very long file name that will not fit".to_vec(),
            cid: vec![0; 16],
            size: 1,
            mtime: crate::codec::PackedMtime::ZERO,
            extra: 0,
        };
        let err = bf.append_item(&item).unwrap_err();
        assert!(matches!(err, BlockFileError::TooLarge { .. }));
    }

    fn corrupt_tail_block_fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        let mut bf = BlockFile::create(&path, 64, BlockDigest::Md5, MAGIC_CONTENT).unwrap();
        bf.append_setting(SETTING_BLOCKSIZE, b"64").unwrap();
        bf.append_setting(SETTING_BLOCKSUM, b"md5").unwrap();
        bf.finalize_settings().unwrap();
        let item = crate::codec::Item::Content {
            cid: vec![1, 2, 3, 4],
            checksum: vec![1, 2, 3, 4],
            first_seen: 42,
        };
        bf.append_item(&item).unwrap();
        bf.sync().unwrap();
        bf.close().unwrap();

        // Corrupt the trailing block's checksum bytes.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn open_rw_repairing_repairs_corrupt_tail_block() {
        let (_dir, path) = corrupt_tail_block_fixture();
        let bf2 = BlockFile::open_rw_repairing(&path).unwrap();
        assert!(bf2.replay().unwrap().is_empty());
    }

    #[test]
    fn open_rw_refuses_corrupt_tail_block() {
        let (_dir, path) = corrupt_tail_block_fixture();
        let err = BlockFile::open_rw(&path).unwrap_err();
        assert!(matches!(err, BlockFileError::Integrity));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::codec::Item;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn arbitrary_content_items_survive_a_write_replay_round_trip(
            checksums in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..20), 1..15),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("content");
            let mut bf = BlockFile::create(&path, 128, BlockDigest::Sha256, MAGIC_CONTENT).unwrap();
            bf.append_setting(SETTING_BLOCKSIZE, b"128").unwrap();
            bf.append_setting(SETTING_BLOCKSUM, b"sha256").unwrap();
            bf.finalize_settings().unwrap();

            let items: Vec<Item> = checksums
                .iter()
                .enumerate()
                .map(|(i, checksum)| Item::Content {
                    cid: checksum.clone(),
                    checksum: checksum.clone(),
                    first_seen: i as u32,
                })
                .collect();
            for item in &items {
                bf.append_item(item).unwrap();
            }
            bf.close().unwrap();

            let bf2 = BlockFile::open_rw(&path).unwrap();
            let replayed = bf2.replay().unwrap();
            prop_assert_eq!(replayed, items);
        }
    }
}
