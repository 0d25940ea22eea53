use ebakup::block::DEFAULT_BLOCK_SIZE;
use ebakup::codec::FileType;
use ebakup::digest::BlockDigest;
use ebakup::storage::StorageRoot;

fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, 0)
        .unwrap()
}

#[test]
fn create_backup_reopen_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage =
        StorageRoot::create(dir.path(), DEFAULT_BLOCK_SIZE, BlockDigest::Sha256).unwrap();

    let data = b"hello, ebakup";
    let checksum = BlockDigest::Sha256.digest(data);
    let cid = storage.get_or_add_content(&checksum, 1_000, &data[..]).unwrap();

    let start = dt(2024, 3, 1, 10, 0);
    let mut builder = storage.start_backup(start).unwrap();
    builder
        .add_directory(&[b"home".to_vec()], 0)
        .unwrap();
    builder
        .add_file(
            &[b"home".to_vec(), b"greeting.txt".to_vec()],
            FileType::Regular,
            cid.clone(),
            data.len() as u64,
            ebakup::codec::PackedMtime::ZERO,
            0,
        )
        .unwrap();
    builder.commit(dt(2024, 3, 1, 10, 1)).unwrap();
    storage.rescan().unwrap();
    storage.close().unwrap();

    let storage = StorageRoot::open(dir.path()).unwrap();
    let name = storage.get_most_recent_backup().unwrap().to_path_buf();
    assert!(name.exists());

    let backup_name = format!("{}/{}", start.format("%Y"), start.format("%m-%dT%H:%M"));
    let reader = storage.open_backup(&backup_name).unwrap();
    let listing = reader.list_directory(&[b"home".to_vec()]).unwrap();
    assert_eq!(listing, vec![b"greeting.txt".to_vec()]);

    let info = reader
        .get_file_info(&[b"home".to_vec(), b"greeting.txt".to_vec()])
        .unwrap();
    assert_eq!(info.cid, cid);
    assert_eq!(info.size, data.len() as u64);

    let mut body = Vec::new();
    std::io::Read::read_to_end(&mut storage.get_content_reader(&cid).unwrap(), &mut body).unwrap();
    assert_eq!(body, data);
}
