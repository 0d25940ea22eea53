//! `db/content`: the content registry and the sharded body pool.
//!
//! Grounded on `pyebakup/dbinternals/contentdb.py`: two in-memory maps
//! (`by_cid`, `by_checksum`) rebuilt by replaying every `content` item at
//! open, and a content-id allocation rule that walks a suffix sequence
//! `\x00, \x01, …, \xff, \x00\x00, …` until it finds a cid not already
//! registered for that checksum.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::block::{BlockFile, MAGIC_CONTENT, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::codec::Item;
use crate::digest::BlockDigest;
use crate::error::ContentStoreError;

/// One registered content item: a cid, the checksum it was stored under,
/// and the time it was first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub cid: Vec<u8>,
    pub checksum: Vec<u8>,
    pub first_seen: u32,
}

pub struct ContentStore {
    block: BlockFile,
    by_cid: HashMap<Vec<u8>, ContentInfo>,
    by_checksum: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    insertion_order: Vec<Vec<u8>>,
    root: PathBuf,
}

impl ContentStore {
    /// Create a fresh, empty content registry at `<root>/content`.
    pub fn create(
        root: &Path,
        block_size: usize,
        digest: BlockDigest,
    ) -> Result<ContentStore, ContentStoreError> {
        let path = root.join("content");
        let mut block = BlockFile::create(&path, block_size, digest, MAGIC_CONTENT)?;
        block.append_setting(SETTING_BLOCKSIZE, block_size.to_string().as_bytes())?;
        block.append_setting(SETTING_BLOCKSUM, digest.name().as_bytes())?;
        block.finalize_settings()?;
        Ok(ContentStore {
            block,
            by_cid: HashMap::new(),
            by_checksum: HashMap::new(),
            insertion_order: Vec::new(),
            root: root.to_path_buf(),
        })
    }

    /// Open an existing content registry, replaying every `content` item to
    /// rebuild the in-memory maps.
    pub fn open(root: &Path) -> Result<ContentStore, ContentStoreError> {
        let path = root.join("content");
        let block = BlockFile::open_rw(&path)?;
        let items = block.replay()?;

        let mut by_cid = HashMap::new();
        let mut by_checksum: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        let mut insertion_order = Vec::new();
        for item in items {
            match item {
                Item::Content {
                    cid,
                    checksum,
                    first_seen,
                } => {
                    by_checksum.entry(checksum.clone()).or_default().push(cid.clone());
                    insertion_order.push(cid.clone());
                    by_cid.insert(
                        cid.clone(),
                        ContentInfo {
                            cid,
                            checksum,
                            first_seen,
                        },
                    );
                }
                other => warn!("unexpected item kind in content registry: {other:?}"),
            }
        }
        debug!("loaded {} content items from {}", insertion_order.len(), path.display());
        Ok(ContentStore {
            block,
            by_cid,
            by_checksum,
            insertion_order,
            root: root.to_path_buf(),
        })
    }

    /// The cid `add_content`/`register_content` would allocate for
    /// `checksum` right now, without registering anything. A caller that
    /// needs the body written under its cid before the registry records it
    /// (see `register_content`) peeks this first.
    pub fn peek_allocate_cid(&self, checksum: &[u8]) -> Vec<u8> {
        let existing = self
            .by_checksum
            .get(checksum)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        allocate_cid(checksum, existing)
    }

    /// Allocate a cid for `checksum`, append a `content` item recording it,
    /// fsync, and update the in-memory maps. See the allocation rule above.
    pub fn add_content(&mut self, checksum: &[u8], when: u32) -> Result<Vec<u8>, ContentStoreError> {
        let cid = self.peek_allocate_cid(checksum);
        self.register_content(cid.clone(), checksum, when)?;
        Ok(cid)
    }

    /// Append a `content` item for a cid already allocated via
    /// `peek_allocate_cid`, fsync, and update the in-memory maps. Exists so
    /// a caller can write the body under `cid` first and only register the
    /// cid once the body is durably on disk — a crash before this call
    /// leaves a dangling body, not a dangling registry entry.
    pub fn register_content(
        &mut self,
        cid: Vec<u8>,
        checksum: &[u8],
        when: u32,
    ) -> Result<(), ContentStoreError> {
        let item = Item::Content {
            cid: cid.clone(),
            checksum: checksum.to_vec(),
            first_seen: when,
        };
        self.block.append_item(&item)?;
        self.block.sync()?;

        self.by_checksum
            .entry(checksum.to_vec())
            .or_default()
            .push(cid.clone());
        self.insertion_order.push(cid.clone());
        self.by_cid.insert(
            cid.clone(),
            ContentInfo {
                cid,
                checksum: checksum.to_vec(),
                first_seen: when,
            },
        );
        Ok(())
    }

    pub fn get_content_info(&self, cid: &[u8]) -> Option<&ContentInfo> {
        self.by_cid.get(cid)
    }

    /// All infos registered under `checksum`, in the order they were added.
    pub fn get_all_infos_with_checksum(&self, checksum: &[u8]) -> Vec<&ContentInfo> {
        self.by_checksum
            .get(checksum)
            .map(|cids| cids.iter().filter_map(|c| self.by_cid.get(c)).collect())
            .unwrap_or_default()
    }

    /// All cids, in the order their `content` items were added.
    pub fn iterate_contentids(&self) -> impl Iterator<Item = &[u8]> {
        self.insertion_order.iter().map(Vec::as_slice)
    }

    /// The filesystem location of a body given its cid: `<root>/<hex
    /// b0>/<hex b1>/<hex rest>`.
    pub fn body_path(&self, cid: &[u8]) -> PathBuf {
        shard_path(&self.root, cid)
    }

    /// Open a stored body for reading.
    pub fn get_content_reader(&self, cid: &[u8]) -> io::Result<File> {
        File::open(self.body_path(cid))
    }

    /// Copy `reader` into the body pool under `cid`, creating shard
    /// directories as needed, then fsync.
    pub fn write_body(&self, cid: &[u8], mut reader: impl Read) -> io::Result<()> {
        let path = self.body_path(cid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = File::create(&path)?;
        io::copy(&mut reader, &mut f)?;
        f.sync_all()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), ContentStoreError> {
        self.block.close()?;
        Ok(())
    }
}

fn shard_path(root: &Path, cid: &[u8]) -> PathBuf {
    let b0 = cid.first().copied().unwrap_or(0);
    let b1 = cid.get(1).copied().unwrap_or(0);
    let rest = if cid.len() > 2 { &cid[2..] } else { &[] };
    root.join(hex::encode([b0]))
        .join(hex::encode([b1]))
        .join(hex::encode(rest))
}

/// `cid := checksum`, or, if that's taken, the first `checksum ++ suffix`
/// not already in `existing`, walking suffixes `\x00, \x01, …, \xff,
/// \x00\x00, …`.
fn allocate_cid(checksum: &[u8], existing: &[Vec<u8>]) -> Vec<u8> {
    if !existing.iter().any(|c| c.as_slice() == checksum) {
        return checksum.to_vec();
    }
    let mut extra = vec![0u8];
    loop {
        let mut candidate = checksum.to_vec();
        candidate.extend_from_slice(&extra);
        if !existing.iter().any(|c| c == &candidate) {
            return candidate;
        }
        increment_suffix(&mut extra);
    }
}

fn increment_suffix(extra: &mut Vec<u8>) {
    let last = *extra.last().expect("suffix is never empty");
    if last == 0xff {
        extra.push(0x00);
    } else {
        *extra.last_mut().unwrap() = last + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_2_collision_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ContentStore::create(dir.path(), 4096, BlockDigest::Sha256).unwrap();
        let checksum = vec![0xaa; 32];

        let cid1 = store.add_content(&checksum, 1_000).unwrap();
        assert_eq!(cid1, checksum);

        let cid2 = store.add_content(&checksum, 2_000).unwrap();
        let mut expected2 = checksum.clone();
        expected2.push(0x00);
        assert_eq!(cid2, expected2);

        let cid3 = store.add_content(&checksum, 3_000).unwrap();
        let mut expected3 = checksum.clone();
        expected3.push(0x01);
        assert_eq!(cid3, expected3);

        let infos = store.get_all_infos_with_checksum(&checksum);
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].cid, cid1);
        assert_eq!(infos[2].cid, cid3);
    }

    #[test]
    fn reopen_replays_existing_items_and_preserves_allocation_order() {
        let dir = tempfile::tempdir().unwrap();
        let checksum = vec![0x11; 16];
        {
            let mut store = ContentStore::create(dir.path(), 4096, BlockDigest::Md5).unwrap();
            store.add_content(&checksum, 10).unwrap();
            store.add_content(&checksum, 20).unwrap();
            store.close().unwrap();
        }
        let mut store = ContentStore::open(dir.path()).unwrap();
        let ids: Vec<_> = store.iterate_contentids().map(|c| c.to_vec()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], checksum);

        let cid3 = store.add_content(&checksum, 30).unwrap();
        let mut expected3 = checksum.clone();
        expected3.push(0x01);
        assert_eq!(cid3, expected3);
    }

    #[test]
    fn body_is_sharded_by_first_two_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::create(dir.path(), 4096, BlockDigest::Sha256).unwrap();
        let cid = vec![0xde, 0xad, 0xbe, 0xef];
        let path = store.body_path(&cid);
        assert!(path.ends_with("de/ad/beef"));
    }

    #[test]
    fn open_refuses_a_corrupted_registry_instead_of_repairing_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ContentStore::create(dir.path(), 64, BlockDigest::Md5).unwrap();
        store.add_content(&[1, 2, 3, 4], 42).unwrap();
        store.close().unwrap();

        let path = dir.path().join("content");
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = ContentStore::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ContentStoreError::BlockFile(crate::error::BlockFileError::Integrity)
        ));
    }
}
