//! [`StorageRoot`]: the top-level coordinator binding a directory to its
//! main descriptor, content store, and the backups filed under it.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime};
use log::{debug, warn};

use crate::block::{self, MAGIC_MAIN, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::content::{ContentInfo, ContentStore};
use crate::digest::BlockDigest;
use crate::error::StorageError;
use crate::snapshot::{Builder as SnapshotBuilder, SnapshotReader};

/// Sort key used for both the on-disk path and the in-memory backup index:
/// `YYYY/MM-DDTHH:MM` zero-pads every field, so lexicographic order is
/// chronological order.
fn backup_key(start: NaiveDateTime) -> String {
    format!("{:04}/{}", start.year(), start.format("%m-%dT%H:%M"))
}

pub struct StorageRoot {
    root: PathBuf,
    content: ContentStore,
    block_size: usize,
    digest: BlockDigest,
    backups: BTreeMap<String, PathBuf>,
}

impl StorageRoot {
    /// Create a new storage root: `db/main`, `db/content`, nothing else.
    pub fn create(
        root: &Path,
        block_size: usize,
        digest: BlockDigest,
    ) -> Result<StorageRoot, StorageError> {
        let db = root.join("db");
        if db.join("main").exists() {
            return Err(StorageError::AlreadyExists);
        }
        fs::create_dir_all(&db)?;

        let mut main = crate::block::BlockFile::create(&db.join("main"), block_size, digest, MAGIC_MAIN)?;
        main.append_setting(SETTING_BLOCKSIZE, block_size.to_string().as_bytes())?;
        main.append_setting(SETTING_BLOCKSUM, digest.name().as_bytes())?;
        main.append_setting("checksum", digest.name().as_bytes())?;
        main.finalize_settings()?;
        main.close()?;

        let content = ContentStore::create(&db, block_size, digest)?;
        debug!("created storage root at {}", root.display());
        Ok(StorageRoot {
            root: root.to_path_buf(),
            content,
            block_size,
            digest,
            backups: BTreeMap::new(),
        })
    }

    /// Open an existing storage root: read `db/main`, load the content
    /// store, index existing backups, and clean up anything left behind by
    /// a crashed run (stray `.new` builder files, orphaned bodies).
    pub fn open(root: &Path) -> Result<StorageRoot, StorageError> {
        let db = root.join("db");
        let main_path = db.join("main");
        if !main_path.exists() {
            return Err(StorageError::NotFound);
        }
        let (settings, _items) = block::open_ro(&main_path)?;
        let block_size = settings.block_size;
        let digest = settings.digest;

        let content = ContentStore::open(&db)?;
        let backups = scan_backups(&db)?;
        cleanup_orphaned_bodies(root, &content)?;

        Ok(StorageRoot {
            root: root.to_path_buf(),
            content,
            block_size,
            digest,
            backups,
        })
    }

    /// Re-index the backups under `db/` — call after committing a backup
    /// started via `start_backup` so `get_most_recent_backup` sees it.
    pub fn rescan(&mut self) -> Result<(), StorageError> {
        self.backups = scan_backups(&self.root.join("db"))?;
        Ok(())
    }

    /// The checksum algorithm this storage root was created with — every
    /// body and block checksum underneath it uses this algorithm.
    pub fn digest(&self) -> BlockDigest {
        self.digest
    }

    pub fn iterate_contentids(&self) -> impl Iterator<Item = &[u8]> {
        self.content.iterate_contentids()
    }

    pub fn get_content_info(&self, cid: &[u8]) -> Option<&ContentInfo> {
        self.content.get_content_info(cid)
    }

    pub fn get_content_reader(&self, cid: &[u8]) -> std::io::Result<File> {
        self.content.get_content_reader(cid)
    }

    /// Obtain a cid for `checksum`, reusing an existing registration if one
    /// already covers that checksum, otherwise allocating a fresh cid,
    /// copying `body` into the pool under it, and only then registering it —
    /// a crash in between leaves an unreferenced body, not a registered cid
    /// with no body, and `cleanup_orphaned_bodies` sweeps the former on the
    /// next open.
    pub fn get_or_add_content(
        &mut self,
        checksum: &[u8],
        when: u32,
        body: impl Read,
    ) -> Result<Vec<u8>, StorageError> {
        if let Some(info) = self.content.get_all_infos_with_checksum(checksum).first() {
            return Ok(info.cid.clone());
        }
        let cid = self.content.peek_allocate_cid(checksum);
        self.content.write_body(&cid, body)?;
        self.content.register_content(cid.clone(), checksum, when)?;
        Ok(cid)
    }

    pub fn get_most_recent_backup(&self) -> Option<&Path> {
        self.backups.values().next_back().map(PathBuf::as_path)
    }

    pub fn get_most_recent_backup_before(&self, t: NaiveDateTime) -> Option<&Path> {
        let key = backup_key(t);
        self.backups
            .range(..key)
            .next_back()
            .map(|(_, p)| p.as_path())
    }

    pub fn open_backup(&self, name: &str) -> Result<SnapshotReader, StorageError> {
        let path = self.backups.get(name).ok_or(StorageError::NotFound)?;
        Ok(SnapshotReader::open(path)?)
    }

    /// Start a new backup builder under a temporary name.
    pub fn start_backup(&self, start: NaiveDateTime) -> Result<SnapshotBuilder, StorageError> {
        Ok(SnapshotBuilder::create(&self.root, start, self.block_size, self.digest)?)
    }

    pub fn close(self) -> Result<(), StorageError> {
        self.content.close()?;
        Ok(())
    }
}

fn scan_backups(db: &Path) -> Result<BTreeMap<String, PathBuf>, StorageError> {
    let mut backups = BTreeMap::new();
    let Ok(years) = fs::read_dir(db) else {
        return Ok(backups);
    };
    for year_entry in years {
        let year_entry = year_entry?;
        let year_path = year_entry.path();
        if !year_path.is_dir() {
            continue;
        }
        let Some(year) = year_entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        for entry in fs::read_dir(&year_path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".new") {
                warn!("removing stray uncommitted backup {}", path.display());
                let _ = fs::remove_file(&path);
                continue;
            }
            backups.insert(format!("{year}/{name}"), path);
        }
    }
    Ok(backups)
}

/// Remove body files whose cid is not registered in the content store — the
/// visible remnant of a body copied in before its `add_content` call
/// completed.
fn cleanup_orphaned_bodies(root: &Path, content: &ContentStore) -> Result<(), StorageError> {
    let Ok(top) = fs::read_dir(root) else {
        return Ok(());
    };
    for e1 in top {
        let e1 = e1?;
        if e1.file_name() == OsStr::new("db") || !e1.path().is_dir() {
            continue;
        }
        let Some(b0) = hex_byte(&e1.file_name()) else { continue };
        let Ok(mid) = fs::read_dir(e1.path()) else { continue };
        for e2 in mid {
            let e2 = e2?;
            if !e2.path().is_dir() {
                continue;
            }
            let Some(b1) = hex_byte(&e2.file_name()) else { continue };
            let Ok(leaves) = fs::read_dir(e2.path()) else { continue };
            for e3 in leaves {
                let e3 = e3?;
                let path = e3.path();
                if !path.is_file() {
                    continue;
                }
                let Some(rest) = e3
                    .file_name()
                    .to_str()
                    .and_then(|s| hex::decode(s).ok())
                else {
                    continue;
                };
                let mut cid = vec![b0, b1];
                cid.extend(rest);
                if content.get_content_info(&cid).is_none() {
                    warn!("removing orphaned body {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
    Ok(())
}

fn hex_byte(name: &OsStr) -> Option<u8> {
    let s = name.to_str()?;
    let bytes = hex::decode(s).ok()?;
    if bytes.len() == 1 {
        Some(bytes[0])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DEFAULT_BLOCK_SIZE;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn create_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        StorageRoot::create(dir.path(), DEFAULT_BLOCK_SIZE, BlockDigest::Sha256)
            .unwrap()
            .close()
            .unwrap();

        let storage = StorageRoot::open(dir.path()).unwrap();
        assert_eq!(storage.iterate_contentids().count(), 0);
        assert!(storage.get_most_recent_backup().is_none());
    }

    #[test]
    fn full_backup_cycle_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage =
            StorageRoot::create(dir.path(), DEFAULT_BLOCK_SIZE, BlockDigest::Sha256).unwrap();

        let checksum = vec![0x42; 32];
        let cid1 = storage.get_or_add_content(&checksum, 100, &b"hello"[..]).unwrap();
        let cid2 = storage.get_or_add_content(&checksum, 200, &b"hello"[..]).unwrap();
        assert_eq!(cid1, cid2, "identical checksum should reuse the cid");

        let mut reader = storage.get_content_reader(&cid1).unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");

        let start = dt(2024, 5, 1, 9, 0, 0);
        let builder = storage.start_backup(start).unwrap();
        drop(builder); // cancelled: leaves a .new file

        storage.rescan().unwrap();
        assert!(storage.get_most_recent_backup().is_none());

        let builder = storage.start_backup(start).unwrap();
        builder.commit(dt(2024, 5, 1, 9, 1, 0)).unwrap();
        storage.rescan().unwrap();
        assert!(storage.get_most_recent_backup().is_some());

        storage.close().unwrap();

        // Reopening should sweep the stray `.new` left by the dropped builder.
        let storage2 = StorageRoot::open(dir.path()).unwrap();
        assert!(storage2.get_most_recent_backup().is_some());
    }

    #[test]
    fn orphaned_body_from_a_crash_before_registration_is_swept_not_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            StorageRoot::create(dir.path(), DEFAULT_BLOCK_SIZE, BlockDigest::Sha256).unwrap();

        // Simulate a crash between `write_body` and `register_content`: the
        // body lands on disk but the registry never learns its cid.
        let cid = storage.content.peek_allocate_cid(&[9u8; 32]);
        storage.content.write_body(&cid, &b"orphan"[..]).unwrap();
        assert!(storage.content.body_path(&cid).exists());
        storage.close().unwrap();

        // Reopening must remove the orphaned body, not invent a registry
        // entry for it.
        let storage2 = StorageRoot::open(dir.path()).unwrap();
        assert!(!storage2.content.body_path(&cid).exists());
        assert!(storage2.get_content_info(&cid).is_none());
    }
}
