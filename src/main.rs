use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Timelike, Utc};
use clap::{Parser, Subcommand};

use ebakup::block::DEFAULT_BLOCK_SIZE;
use ebakup::codec::{day_of_year_from_month_day, second_of_year_from_day_hms, FileType, PackedMtime};
use ebakup::digest::BlockDigest;
use ebakup::error::{EbakupError, StorageError};
use ebakup::snapshot::Builder as SnapshotBuilder;
use ebakup::source::{BodyReader, EntryKind, SequentialBodyReader, SourceEntry, SourceStream};
use ebakup::storage::StorageRoot;

#[derive(Parser)]
#[command(name = "ebakup", version, about = "Content-addressed backup engine")]
struct Cli {
    /// Path to the storage root.
    #[arg(long, global = true)]
    storage: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one or more source paths into a new snapshot.
    Backup {
        /// Create the storage root if it does not already exist.
        #[arg(long)]
        create: bool,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Print a summary of the storage root.
    Info,
    /// Recompute and check every stored body's checksum.
    Verify,
    /// Placeholder for the embedded status UI (not part of the core).
    Webui {
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Backup { create, paths } => cmd_backup(&cli.storage, *create, paths),
        Commands::Info => cmd_info(&cli.storage),
        Commands::Verify => cmd_verify(&cli.storage),
        Commands::Webui { port } => cmd_webui(*port),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn cmd_backup(storage_path: &Path, create: bool, paths: &[PathBuf]) -> Result<(), EbakupError> {
    let mut storage = if create {
        match StorageRoot::create(storage_path, DEFAULT_BLOCK_SIZE, BlockDigest::DEFAULT) {
            Ok(s) => s,
            Err(StorageError::AlreadyExists) => StorageRoot::open(storage_path)?,
            Err(e) => return Err(e.into()),
        }
    } else {
        StorageRoot::open(storage_path)?
    };

    let start = Utc::now().naive_utc();
    let mut builder = storage.start_backup(start)?;
    let digest = storage.digest();
    let mut stream = FilesystemSourceStream::new(paths.to_vec());
    while let Some((entry, body)) = stream.next_entry()? {
        apply_entry(&mut storage, &mut builder, digest, entry, body)?;
    }
    let end = Utc::now().naive_utc();
    builder.commit(end)?;
    storage.rescan()?;
    println!(
        "backup complete: {} source path(s) under {}",
        paths.len(),
        storage_path.display()
    );
    Ok(())
}

fn apply_entry(
    storage: &mut StorageRoot,
    builder: &mut SnapshotBuilder,
    digest: BlockDigest,
    entry: SourceEntry,
    body: Option<Box<dyn BodyReader>>,
) -> Result<(), EbakupError> {
    match entry.kind {
        EntryKind::Directory => {
            builder.add_directory(&entry.path, 0)?;
        }
        EntryKind::File(filetype) => {
            let mut body = body.expect("a file entry always carries a body reader");
            let data = drain_body(&mut *body)?;
            let checksum = digest.digest(&data);
            let cid = storage.get_or_add_content(&checksum, entry.first_seen, &data[..])?;
            builder.add_file(&entry.path, filetype, cid, entry.size, entry.mtime, 0)?;
        }
    }
    Ok(())
}

/// Read a [`BodyReader`] to completion. The core only ever needs a file's
/// full bytes at once to compute its checksum and hand it to the content
/// store, so this is the one place a `BodyReader` gets driven.
fn drain_body(body: &mut dyn BodyReader) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let chunk = body.read_chunk(out.len() as u64, 64 * 1024)?;
        if chunk.is_empty() {
            return Ok(out);
        }
        out.extend_from_slice(&chunk);
    }
}

/// The CLI's [`SourceStream`] implementation: a breadth-first walk over one
/// or more filesystem roots, yielding directories before the entries they
/// contain.
struct FilesystemSourceStream {
    queue: VecDeque<(PathBuf, Vec<Vec<u8>>)>,
}

impl FilesystemSourceStream {
    fn new(roots: Vec<PathBuf>) -> Self {
        let queue = roots
            .into_iter()
            .map(|root| {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned().into_bytes())
                    .unwrap_or_default();
                (root, vec![name])
            })
            .collect();
        FilesystemSourceStream { queue }
    }
}

impl SourceStream for FilesystemSourceStream {
    fn next_entry(
        &mut self,
    ) -> std::io::Result<Option<(SourceEntry, Option<Box<dyn BodyReader>>)>> {
        let Some((path, here)) = self.queue.pop_front() else {
            return Ok(None);
        };
        let meta = fs::symlink_metadata(&path)?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            let data = target.to_string_lossy().into_owned().into_bytes();
            let entry = SourceEntry {
                path: here,
                kind: EntryKind::File(FileType::Symlink),
                size: data.len() as u64,
                mtime: PackedMtime::ZERO,
                first_seen: 0,
                extra: Vec::new(),
            };
            let reader: Box<dyn BodyReader> =
                Box::new(SequentialBodyReader::new(Cursor::new(data)));
            Ok(Some((entry, Some(reader))))
        } else if meta.is_dir() {
            let mut children: Vec<_> = fs::read_dir(&path)?.collect::<Result<_, _>>()?;
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let mut child_path = here.clone();
                child_path.push(child.file_name().to_string_lossy().into_owned().into_bytes());
                self.queue.push_back((child.path(), child_path));
            }
            let entry = SourceEntry {
                path: here,
                kind: EntryKind::Directory,
                size: 0,
                mtime: PackedMtime::ZERO,
                first_seen: 0,
                extra: Vec::new(),
            };
            Ok(Some((entry, None)))
        } else {
            let mtime = mtime_from_system_time(meta.modified().ok());
            let first_seen = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            let entry = SourceEntry {
                path: here,
                kind: EntryKind::File(FileType::Regular),
                size: meta.len(),
                mtime,
                first_seen,
                extra: Vec::new(),
            };
            let reader: Box<dyn BodyReader> = Box::new(SequentialBodyReader::new(File::open(&path)?));
            Ok(Some((entry, Some(reader))))
        }
    }
}

fn mtime_from_system_time(t: Option<std::time::SystemTime>) -> PackedMtime {
    let Some(t) = t else { return PackedMtime::ZERO };
    let dur = t
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let dt = chrono::DateTime::<chrono::Utc>::from(std::time::UNIX_EPOCH + dur).naive_utc();
    let year = dt.year() as u16;
    let day_of_year = day_of_year_from_month_day(year, dt.month(), dt.day());
    let second_of_year = second_of_year_from_day_hms(day_of_year, dt.hour(), dt.minute(), dt.second());
    PackedMtime {
        year,
        second_of_year,
        nsec: dt.nanosecond(),
    }
}

fn cmd_info(storage_path: &Path) -> Result<(), EbakupError> {
    let storage = StorageRoot::open(storage_path)?;
    println!("Storage root: {}", storage_path.display());
    println!("  Content items: {}", storage.iterate_contentids().count());
    match storage.get_most_recent_backup() {
        Some(p) => println!("  Most recent backup: {}", p.display()),
        None => println!("  Most recent backup: (none)"),
    }
    Ok(())
}

fn cmd_verify(storage_path: &Path) -> Result<(), EbakupError> {
    let storage = StorageRoot::open(storage_path)?;
    let digest = storage.digest();
    let cids: Vec<Vec<u8>> = storage.iterate_contentids().map(|c| c.to_vec()).collect();
    let mut checked = 0u64;
    let mut bad = 0u64;
    for cid in &cids {
        let info = storage
            .get_content_info(cid)
            .expect("cid from iterate_contentids is always registered");
        let mut f = storage.get_content_reader(cid)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let actual = digest.digest(&buf);
        checked += 1;
        if actual != info.checksum {
            bad += 1;
            eprintln!("integrity mismatch: cid {}", hex::encode(cid));
        }
    }
    println!("verified {checked} content item(s), {bad} mismatch(es)");
    if bad > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_webui(port: u16) -> Result<(), EbakupError> {
    println!("webui is an outer-system concern, not part of the core; would listen on port {port}");
    Ok(())
}
