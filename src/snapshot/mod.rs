//! `db/<year>/<MM-DDTHH:MM>`: one backup run, as a builder while being
//! written and a reader once committed.
//!
//! Directory ids are interned per snapshot (assigned in first-seen order,
//! starting at 8); `key-value`/`extradef` items dedup repeated metadata sets
//! the same way. Grounded on `sixcy::io_stream`'s writer/reader split,
//! generalized from a byte-chunk stream to a typed item stream.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, warn};

use crate::block::{self, BlockFile, SettingsBlock, MAGIC_BACKUP, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::codec::{is_valid_name, FileType, Item, PackedMtime};
use crate::digest::BlockDigest;
use crate::error::SnapshotError;

const START_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NAME_FORMAT: &str = "%m-%dT%H:%M";

/// Where a given start time's snapshot file (final and temporary) live.
pub fn snapshot_paths(root: &Path, start: NaiveDateTime) -> (PathBuf, PathBuf) {
    use chrono::Datelike;
    let dir = root.join("db").join(format!("{:04}", start.year()));
    let name = start.format(NAME_FORMAT).to_string();
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!("{name}.new"));
    (final_path, tmp_path)
}

/// A single full directory path as a sequence of byte-string components,
/// root-relative (`[]` is the virtual root).
pub type DirPath = [Vec<u8>];

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct Builder {
    block: BlockFile,
    final_path: PathBuf,
    tmp_path: PathBuf,
    next_dirid: u64,
    dirs: HashMap<Vec<Vec<u8>>, u64>,
    next_kvid: u64,
    next_xid: u64,
    kv_seen: HashMap<(Vec<u8>, Vec<u8>), u64>,
    extradefs_seen: HashMap<Vec<(Vec<u8>, Vec<u8>)>, u64>,
}

impl Builder {
    pub fn create(
        root: &Path,
        start: NaiveDateTime,
        block_size: usize,
        digest: BlockDigest,
    ) -> Result<Builder, SnapshotError> {
        let (final_path, tmp_path) = snapshot_paths(root, start);
        if final_path.exists() {
            return Err(SnapshotError::AlreadyExists);
        }
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut block = BlockFile::create(&tmp_path, block_size, digest, MAGIC_BACKUP)?;
        block.append_setting(SETTING_BLOCKSIZE, block_size.to_string().as_bytes())?;
        block.append_setting(SETTING_BLOCKSUM, digest.name().as_bytes())?;
        block.append_setting("start", start.format(START_FORMAT).to_string().as_bytes())?;
        // Settings stay open: `finalize_settings` is deferred to `commit`,
        // once `end` is known.

        Ok(Builder {
            block,
            final_path,
            tmp_path,
            next_dirid: 8,
            dirs: HashMap::new(),
            next_kvid: 0,
            next_xid: 0,
            kv_seen: HashMap::new(),
            extradefs_seen: HashMap::new(),
        })
    }

    /// Assign (or look up) the dirid for `path`, creating any intermediate
    /// directories in this snapshot that haven't been seen yet.
    pub fn add_directory(&mut self, path: &DirPath, extra: u64) -> Result<u64, SnapshotError> {
        self.ensure_dir(path, extra)
    }

    fn ensure_dir(&mut self, path: &DirPath, extra: u64) -> Result<u64, SnapshotError> {
        if path.is_empty() {
            return Ok(0);
        }
        if let Some(&id) = self.dirs.get(path) {
            return Ok(id);
        }
        let parent_id = self.ensure_dir(&path[..path.len() - 1], 0)?;
        let name = path.last().expect("non-empty path").clone();
        if !is_valid_name(&name) {
            return Err(SnapshotError::Format("directory name contains LF".into()));
        }
        let dirid = self.next_dirid;
        self.next_dirid += 1;
        self.block.append_item(&Item::Directory {
            dirid,
            parent: parent_id,
            name,
            extra,
        })?;
        self.dirs.insert(path.to_vec(), dirid);
        Ok(dirid)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        path: &DirPath,
        filetype: FileType,
        cid: Vec<u8>,
        size: u64,
        mtime: PackedMtime,
        extra: u64,
    ) -> Result<(), SnapshotError> {
        let (parent_path, name) = path
            .split_last()
            .map(|(n, p)| (p, n))
            .ok_or_else(|| SnapshotError::Format("empty file path".into()))?;
        if !is_valid_name(name) {
            return Err(SnapshotError::Format("file name contains LF".into()));
        }
        let parent_id = self.ensure_dir(parent_path, 0)?;
        self.block.append_item(&Item::File {
            filetype,
            parent: parent_id,
            name: name.clone(),
            cid,
            size,
            mtime,
            extra,
        })?;
        Ok(())
    }

    /// Declare a set of `(key, value)` pairs as one unit of extra metadata,
    /// emitting only the `key-value`/`extradef` items not already seen in
    /// this snapshot, and return the xid to attach to files/directories.
    pub fn set_extra(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<u64, SnapshotError> {
        let mut sorted = pairs.to_vec();
        sorted.sort();
        if let Some(&xid) = self.extradefs_seen.get(&sorted) {
            return Ok(xid);
        }
        let mut kvids = Vec::with_capacity(sorted.len());
        for (key, value) in &sorted {
            let lookup = (key.clone(), value.clone());
            let kvid = if let Some(&id) = self.kv_seen.get(&lookup) {
                id
            } else {
                let id = self.next_kvid;
                self.next_kvid += 1;
                self.block.append_item(&Item::KeyValue {
                    kvid: id,
                    key: key.clone(),
                    value: value.clone(),
                })?;
                self.kv_seen.insert(lookup, id);
                id
            };
            kvids.push(kvid);
        }
        let xid = self.next_xid;
        self.next_xid += 1;
        self.block.append_item(&Item::ExtraDef {
            xid,
            kvids: kvids.clone(),
        })?;
        self.extradefs_seen.insert(sorted, xid);
        Ok(xid)
    }

    /// Append `end`, seal the settings and final data block, fsync, and
    /// atomically rename the temporary file to its final name.
    pub fn commit(mut self, end: NaiveDateTime) -> Result<(), SnapshotError> {
        self.block
            .append_setting("end", end.format(START_FORMAT).to_string().as_bytes())?;
        self.block.finalize_settings()?;
        self.block.close()?;
        block::rename_and_overwrite(&self.tmp_path, &self.final_path)?;
        debug!("committed snapshot {}", self.final_path.display());
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct DirRecord {
    parent: u64,
    name: Vec<u8>,
    extra: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filetype: FileType,
    pub cid: Vec<u8>,
    pub size: u64,
    pub mtime: PackedMtime,
    pub extra: u64,
}

pub struct SnapshotReader {
    settings: SettingsBlock,
    start: String,
    end: Option<String>,
    dirs: HashMap<u64, DirRecord>,
    dir_ids_by_path: HashMap<Vec<Vec<u8>>, u64>,
    files: HashMap<(u64, Vec<u8>), FileInfo>,
    kv: HashMap<u64, (Vec<u8>, Vec<u8>)>,
    extradefs: HashMap<u64, Vec<u64>>,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<SnapshotReader, SnapshotError> {
        let (settings, items) = block::open_ro(path)?;
        let start = settings
            .get_str("start")
            .ok_or_else(|| SnapshotError::Format("missing start setting".into()))?
            .to_string();
        let end = settings.get_str("end").map(str::to_string);

        let mut dirs = HashMap::new();
        dirs.insert(0, DirRecord { parent: 0, name: Vec::new(), extra: 0 });
        let mut files = HashMap::new();
        let mut kv = HashMap::new();
        let mut extradefs = HashMap::new();

        for item in items {
            match item? {
                Item::Directory { dirid, parent, name, extra } => {
                    dirs.insert(dirid, DirRecord { parent, name, extra });
                }
                Item::File { filetype, parent, name, cid, size, mtime, extra } => {
                    files.insert(
                        (parent, name),
                        FileInfo { filetype, cid, size, mtime, extra },
                    );
                }
                Item::KeyValue { kvid, key, value } => {
                    kv.insert(kvid, (key, value));
                }
                Item::ExtraDef { xid, kvids } => {
                    extradefs.insert(xid, kvids);
                }
                Item::Content { .. } => {
                    warn!("unexpected content item in snapshot {}", path.display());
                }
            }
        }

        let mut dir_ids_by_path = HashMap::new();
        dir_ids_by_path.insert(Vec::new(), 0u64);
        let dirids: Vec<u64> = dirs.keys().copied().collect();
        for dirid in dirids {
            resolve_dir_path(dirid, &dirs, &mut dir_ids_by_path);
        }

        Ok(SnapshotReader {
            settings,
            start,
            end,
            dirs,
            dir_ids_by_path,
            files,
            kv,
            extradefs,
        })
    }

    pub fn settings(&self) -> &SettingsBlock {
        &self.settings
    }

    pub fn get_start_time(&self) -> &str {
        &self.start
    }

    pub fn get_end_time(&self) -> Option<&str> {
        self.end.as_deref()
    }

    fn dirid_for_path(&self, path: &DirPath) -> Option<u64> {
        self.dir_ids_by_path.get(path).copied()
    }

    /// Direct children (directories, then files) of `path`, by name.
    pub fn list_directory(&self, path: &DirPath) -> Result<Vec<Vec<u8>>, SnapshotError> {
        let dirid = self
            .dirid_for_path(path)
            .ok_or(SnapshotError::NotFound)?;
        let mut names: Vec<Vec<u8>> = self
            .dirs
            .iter()
            .filter(|(&id, rec)| id != 0 && rec.parent == dirid)
            .map(|(_, rec)| rec.name.clone())
            .collect();
        names.extend(
            self.files
                .keys()
                .filter(|(parent, _)| *parent == dirid)
                .map(|(_, name)| name.clone()),
        );
        names.sort();
        Ok(names)
    }

    pub fn get_file_info(&self, path: &DirPath) -> Result<&FileInfo, SnapshotError> {
        let (name, parent_path) = path.split_last().ok_or(SnapshotError::NotFound)?;
        let parent_id = self.dirid_for_path(parent_path).ok_or(SnapshotError::NotFound)?;
        self.files
            .get(&(parent_id, name.clone()))
            .ok_or(SnapshotError::NotFound)
    }

    /// Resolve an `extra` xid into its `(key, value)` pairs.
    pub fn resolve_extra(&self, xid: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.extradefs
            .get(&xid)
            .map(|kvids| {
                kvids
                    .iter()
                    .filter_map(|id| self.kv.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn resolve_dir_path(
    dirid: u64,
    dirs: &HashMap<u64, DirRecord>,
    cache: &mut HashMap<Vec<Vec<u8>>, u64>,
) -> Vec<Vec<u8>> {
    if dirid == 0 {
        return Vec::new();
    }
    if let Some((path, _)) = cache.iter().find(|(_, &id)| id == dirid) {
        return path.clone();
    }
    let rec = match dirs.get(&dirid) {
        Some(r) => r,
        None => return Vec::new(),
    };
    let mut path = resolve_dir_path(rec.parent, dirs, cache);
    path.push(rec.name.clone());
    cache.insert(path.clone(), dirid);
    path
}
