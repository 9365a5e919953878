//! End-to-end scenarios: rebuild/refresh convergence, analysis reports,
//! hash-collision handling under a weak digest, and cross-archive import.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use aridx_core::{Archive, CoreError, Processor};
use aridx_store::{report_directory_for, DuplicateMatchRule, DuplicateRecord, ReportStore};

fn processor() -> Arc<Processor> {
    Arc::new(Processor::new(Some(2)))
}

fn open_archive(path: &Path) -> Archive {
    Archive::open(processor(), path, true).unwrap()
}

fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Copy atime and mtime from one path to another.
fn copy_times(from: &Path, to: &Path) {
    let metadata = fs::metadata(from).unwrap();
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    filetime::set_file_times(to, atime, mtime).unwrap();
}

/// ctime cannot be copied between independently created files, so scenario
/// rules exclude it; everything else follows the default rule.
fn scenario_rule() -> DuplicateMatchRule {
    DuplicateMatchRule {
        include_ctime: false,
        ..DuplicateMatchRule::default()
    }
}

fn read_record(input: &Path, relative: &str) -> Option<DuplicateRecord> {
    let store = ReportStore::open(report_directory_for(input), false).unwrap();
    store.lookup_record(Path::new(relative)).unwrap()
}

#[tokio::test]
async fn s1_exact_file_duplicate() {
    let archive_dir = TempDir::new().unwrap();
    let original = write_file(archive_dir.path(), "original.txt", b"test content");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target_dir = target_root.path().join("incoming");
    fs::create_dir(&target_dir).unwrap();
    let duplicate = write_file(&target_dir, "duplicate.txt", b"test content");
    copy_times(&original, &duplicate);

    archive
        .analyze(&[target_dir.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&target_dir, "incoming/duplicate.txt").unwrap();
    assert_eq!(record.matches.len(), 1);
    let matched = &record.matches[0];
    assert_eq!(matched.path, PathBuf::from("original.txt"));
    assert!(matched.is_identical);
    assert!(matched.matches.mtime);
    assert_eq!(matched.duplicated_items, 1);
    assert_eq!(record.duplicated_items, 1);
    assert_eq!(record.total_items, 1);
    assert_eq!(record.total_size, b"test content".len() as u64);
}

#[tokio::test]
async fn s2_content_only_match_on_mtime_shift() {
    let archive_dir = TempDir::new().unwrap();
    let original = write_file(archive_dir.path(), "original.txt", b"test content");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target_dir = target_root.path().join("incoming");
    fs::create_dir(&target_dir).unwrap();
    let duplicate = write_file(&target_dir, "duplicate.txt", b"test content");

    let metadata = fs::metadata(&original).unwrap();
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let shifted = filetime::FileTime::from_unix_time(mtime.unix_seconds() + 5, mtime.nanoseconds());
    filetime::set_file_times(&duplicate, atime, shifted).unwrap();

    archive
        .analyze(&[target_dir.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&target_dir, "incoming/duplicate.txt").unwrap();
    assert_eq!(record.matches.len(), 1);
    let matched = &record.matches[0];
    assert!(!matched.matches.mtime);
    assert!(!matched.is_identical);
    assert_eq!(matched.duplicated_items, 1);
    assert_eq!(record.duplicated_items, 1);
}

#[tokio::test]
async fn s3_multi_duplicate_counts_once_globally() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "dup1.txt", b"duplicate");
    write_file(archive_dir.path(), "dup2.txt", b"duplicate");
    write_file(archive_dir.path(), "dup3.txt", b"duplicate");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target = write_file(target_root.path(), "file.txt", b"duplicate");

    archive
        .analyze(&[target.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&target, "file.txt").unwrap();
    assert_eq!(record.matches.len(), 3);
    // Globally deduplicated: the analyzed file counts once.
    assert_eq!(record.duplicated_size, b"duplicate".len() as u64);
    assert_eq!(record.duplicated_items, 1);
    // Localized: each archive location counts it independently.
    for matched in &record.matches {
        assert_eq!(matched.duplicated_size, b"duplicate".len() as u64);
        assert_eq!(matched.duplicated_items, 1);
    }
}

#[tokio::test]
async fn s4_partial_match_directory_is_superset_not_identical() {
    let archive_dir = TempDir::new().unwrap();
    let big_file1 = write_file(archive_dir.path(), "bigdir/file1", b"one");
    let big_file2 = write_file(archive_dir.path(), "bigdir/file2", b"two");
    write_file(archive_dir.path(), "bigdir/extra", b"extra");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let small_dir = target_root.path().join("smalldir");
    fs::create_dir(&small_dir).unwrap();
    let small_file1 = write_file(&small_dir, "file1", b"one");
    let small_file2 = write_file(&small_dir, "file2", b"two");
    copy_times(&big_file1, &small_file1);
    copy_times(&big_file2, &small_file2);
    copy_times(&archive_dir.path().join("bigdir"), &small_dir);

    archive
        .analyze(&[small_dir.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&small_dir, "smalldir").unwrap();
    assert_eq!(record.matches.len(), 1);
    let matched = &record.matches[0];
    assert_eq!(matched.path, PathBuf::from("bigdir"));
    assert!(!matched.is_identical);
    assert!(matched.is_superset);
    assert_eq!(matched.duplicated_items, 2);
    // Unconditional totals over all children.
    assert_eq!(record.total_items, 2);
    assert_eq!(record.total_size, 6);
    assert_eq!(record.duplicated_items, 2);
}

#[tokio::test]
async fn s5_weak_hash_collisions_split_into_distinct_classes() {
    let archive_dir = TempDir::new().unwrap();
    // Both contents XOR to the zero digest under xor4.
    write_file(archive_dir.path(), "a1", b"\x00\x00\x00\x01\x00\x00\x00\x01");
    write_file(archive_dir.path(), "a2", b"\x00\x00\x00\x01\x00\x00\x00\x01");
    write_file(archive_dir.path(), "b1", b"\x00\x00\x00\x02\x00\x00\x00\x02");
    write_file(archive_dir.path(), "b2", b"\x00\x00\x00\x02\x00\x00\x00\x02");

    let archive = open_archive(archive_dir.path());
    archive.rebuild_with("xor4").await.unwrap();

    let classes = archive.store().list_ec_classes(&[0, 0, 0, 0]).unwrap();
    assert_eq!(classes.len(), 2, "one EC class per distinct content");

    let class_of = |name: &str| -> u32 {
        classes
            .iter()
            .find(|(_, paths)| paths.contains(&PathBuf::from(name)))
            .map(|(ec_id, _)| *ec_id)
            .unwrap()
    };
    assert_eq!(class_of("a1"), class_of("a2"));
    assert_eq!(class_of("b1"), class_of("b2"));
    assert_ne!(class_of("a1"), class_of("b1"));

    // Every class member is byte-identical (spot check by re-reading).
    for (_, paths) in &classes {
        let first = fs::read(archive_dir.path().join(&paths[0])).unwrap();
        for path in paths {
            assert_eq!(fs::read(archive_dir.path().join(path)).unwrap(), first);
        }
    }
}

#[tokio::test]
async fn s6_refresh_after_delete_preserves_sibling() {
    let archive_dir = TempDir::new().unwrap();
    let doomed = write_file(archive_dir.path(), "doomed.txt", b"shared payload");
    write_file(archive_dir.path(), "survivor.txt", b"shared payload");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let survivor_sig = archive
        .store()
        .lookup_file(Path::new("survivor.txt"))
        .await
        .unwrap()
        .unwrap();
    let survivor_ec = survivor_sig.ec_id.unwrap();

    fs::remove_file(&doomed).unwrap();
    archive.refresh().await.unwrap();

    assert!(archive
        .store()
        .lookup_file(Path::new("doomed.txt"))
        .await
        .unwrap()
        .is_none());

    let classes = archive.store().list_ec_classes(&survivor_sig.digest).unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].0, survivor_ec);
    assert_eq!(classes[0].1, vec![PathBuf::from("survivor.txt")]);

    let survivor = archive
        .store()
        .lookup_file(Path::new("survivor.txt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(survivor.ec_id, Some(survivor_ec));
}

#[tokio::test]
async fn rebuild_is_idempotent() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "a.txt", b"alpha");
    write_file(archive_dir.path(), "nested/b.txt", b"beta");
    write_file(archive_dir.path(), "nested/c.txt", b"alpha");

    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();
    let first = archive.inspect().unwrap();
    archive.rebuild().await.unwrap();
    let second = archive.inspect().unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn refresh_converges_after_mutations() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "stays.txt", b"stays");
    let changing = write_file(archive_dir.path(), "changes.txt", b"before");
    let leaving = write_file(archive_dir.path(), "leaves.txt", b"leaves");

    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    // Mutate: modify, delete, add.
    fs::write(&changing, b"after, longer than before").unwrap();
    let bumped = filetime::FileTime::from_unix_time(
        filetime::FileTime::from_last_modification_time(&fs::metadata(&changing).unwrap())
            .unix_seconds()
            + 10,
        0,
    );
    filetime::set_file_mtime(&changing, bumped).unwrap();
    fs::remove_file(&leaving).unwrap();
    write_file(archive_dir.path(), "arrives.txt", b"arrives");

    archive.refresh().await.unwrap();
    let first = archive.inspect().unwrap();
    archive.refresh().await.unwrap();
    let second = archive.inspect().unwrap();
    assert_eq!(first, second);

    assert!(archive
        .store()
        .lookup_file(Path::new("arrives.txt"))
        .await
        .unwrap()
        .is_some());
    assert!(archive
        .store()
        .lookup_file(Path::new("leaves.txt"))
        .await
        .unwrap()
        .is_none());

    // The modified file's signature tracks the new content.
    let changed = archive
        .store()
        .lookup_file(Path::new("changes.txt"))
        .await
        .unwrap()
        .unwrap();
    let classes = archive.store().list_ec_classes(&changed.digest).unwrap();
    assert!(classes
        .iter()
        .any(|(ec_id, paths)| Some(*ec_id) == changed.ec_id
            && paths.contains(&PathBuf::from("changes.txt"))));
}

#[tokio::test]
async fn signatures_and_ec_membership_stay_consistent() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "one.txt", b"payload-1");
    write_file(archive_dir.path(), "two.txt", b"payload-2");
    write_file(archive_dir.path(), "copy-of-one.txt", b"payload-1");

    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    for (path, signature) in archive.store().list_registered_files().unwrap() {
        let ec_id = signature.ec_id.expect("completed refresh assigns ec ids");
        let classes = archive.store().list_ec_classes(&signature.digest).unwrap();
        let class = classes
            .iter()
            .find(|(id, _)| *id == ec_id)
            .expect("signature's EC class exists");
        assert!(class.1.contains(&path), "{} missing from its class", path.display());
    }
}

#[tokio::test]
async fn import_from_nested_archive_merges_equivalence() {
    let outer_dir = TempDir::new().unwrap();
    write_file(outer_dir.path(), "a.txt", b"shared bytes");
    let inner_path = outer_dir.path().join("sub");
    write_file(outer_dir.path(), "sub/b.txt", b"shared bytes");

    // Index the nested archive on its own, then release it so the importer
    // can reopen its database.
    let inner = open_archive(&inner_path);
    inner.rebuild().await.unwrap();
    drop(inner);

    // Import it into the outer archive, then index the outer tree.
    let outer = open_archive(outer_dir.path());
    outer.import_index(&inner_path).await.unwrap();

    let imported = outer
        .store()
        .lookup_file(Path::new("sub/b.txt"))
        .await
        .unwrap()
        .expect("imported signature present under transformed path");

    outer.refresh().await.unwrap();

    let own = outer
        .store()
        .lookup_file(Path::new("a.txt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.digest, imported.digest);
    assert_eq!(own.ec_id, imported.ec_id, "identical content shares one EC class");

    let classes = outer.store().list_ec_classes(&own.digest).unwrap();
    let class = classes.iter().find(|(id, _)| Some(*id) == own.ec_id).unwrap();
    assert!(class.1.contains(&PathBuf::from("a.txt")));
    assert!(class.1.contains(&PathBuf::from("sub/b.txt")));
}

#[tokio::test]
async fn import_rejects_unrelated_and_same_archive() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    write_file(first_dir.path(), "x", b"x");
    write_file(second_dir.path(), "y", b"y");

    let first = open_archive(first_dir.path());
    first.rebuild().await.unwrap();

    let second = open_archive(second_dir.path());
    second.rebuild().await.unwrap();
    second.close();

    assert!(matches!(
        first.import_index(second_dir.path()).await,
        Err(CoreError::InvalidImportRelationship(_))
    ));
    assert!(matches!(
        first.import_index(first_dir.path()).await,
        Err(CoreError::InvalidImportRelationship(_))
    ));
}

#[tokio::test]
async fn import_rejects_algorithm_mismatch() {
    let outer_dir = TempDir::new().unwrap();
    write_file(outer_dir.path(), "a", b"a");
    let inner_path = outer_dir.path().join("sub");
    write_file(outer_dir.path(), "sub/b", b"b");

    let inner = open_archive(&inner_path);
    inner.rebuild_with("blake3").await.unwrap();
    drop(inner);

    let outer = open_archive(outer_dir.path());
    outer.rebuild().await.unwrap(); // sha256

    assert!(matches!(
        outer.import_index(&inner_path).await,
        Err(CoreError::HashAlgorithmMismatch { .. })
    ));
}

#[tokio::test]
async fn analyze_requires_archive_id() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "a", b"a");
    let archive = open_archive(archive_dir.path());
    // Index created but never built: no archive id, no algorithm.
    archive
        .store()
        .write_manifest("hash-algorithm", Some("sha256"))
        .unwrap();

    let target = TempDir::new().unwrap();
    assert!(matches!(
        archive.analyze(&[target.path().to_path_buf()], None).await,
        Err(CoreError::ArchiveIdMissing)
    ));
}

#[tokio::test]
async fn analyze_refuses_report_path_conflict() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "a", b"a");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target = write_file(target_root.path(), "input.txt", b"a");
    // Occupy the report path with a file.
    fs::write(target_root.path().join("input.txt.report"), b"in the way").unwrap();

    assert!(matches!(
        archive.analyze(&[target], None).await,
        Err(CoreError::Store(aridx_store::StoreError::ReportPathConflict(_)))
    ));
}

#[tokio::test]
async fn deferred_symlinks_resolve_through_parent_directory() {
    let archive_dir = TempDir::new().unwrap();
    let keep_file = write_file(archive_dir.path(), "keep/data.txt", b"linked data");
    std::os::unix::fs::symlink("data.txt", archive_dir.path().join("keep/link")).unwrap();
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target_dir = target_root.path().join("mirror");
    fs::create_dir(&target_dir).unwrap();
    let target_file = write_file(&target_dir, "data.txt", b"linked data");
    std::os::unix::fs::symlink("data.txt", target_dir.join("link")).unwrap();
    copy_times(&keep_file, &target_file);
    copy_times(&archive_dir.path().join("keep"), &target_dir);

    archive
        .analyze(&[target_dir.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&target_dir, "mirror").unwrap();
    assert_eq!(record.matches.len(), 1);
    let matched = &record.matches[0];
    assert_eq!(matched.path, PathBuf::from("keep"));
    // data.txt content-verified plus the symlink matched by target.
    assert_eq!(matched.duplicated_items, 2);
    assert_eq!(record.duplicated_items, 2);
    assert_eq!(record.total_items, 2);
}

#[tokio::test]
async fn identical_directory_match_requires_equal_sets_and_metadata() {
    let archive_dir = TempDir::new().unwrap();
    let doc_a = write_file(archive_dir.path(), "docs/a.txt", b"alpha");
    let doc_b = write_file(archive_dir.path(), "docs/b.txt", b"beta");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let copy_dir = target_root.path().join("docscopy");
    fs::create_dir(&copy_dir).unwrap();
    let copy_a = write_file(&copy_dir, "a.txt", b"alpha");
    let copy_b = write_file(&copy_dir, "b.txt", b"beta");
    copy_times(&doc_a, &copy_a);
    copy_times(&doc_b, &copy_b);
    copy_times(&archive_dir.path().join("docs"), &copy_dir);

    archive
        .analyze(&[copy_dir.clone()], Some(scenario_rule()))
        .await
        .unwrap();

    let record = read_record(&copy_dir, "docscopy").unwrap();
    assert_eq!(record.matches.len(), 1);
    let matched = &record.matches[0];
    assert_eq!(matched.path, PathBuf::from("docs"));
    // Identity requires equal child-name sets, recursive identity, and the
    // rule-selected metadata; superset follows from identity.
    assert!(matched.is_identical);
    assert!(matched.is_superset);
    assert!(matched.matches.mtime && matched.matches.mode);
    assert_eq!(matched.duplicated_items, 2);
    assert_eq!(record.total_items, 2);
    assert_eq!(record.duplicated_size, 9);
}

#[tokio::test]
async fn directory_with_no_duplicates_writes_no_record() {
    let archive_dir = TempDir::new().unwrap();
    write_file(archive_dir.path(), "unrelated.txt", b"unrelated");
    let archive = open_archive(archive_dir.path());
    archive.rebuild().await.unwrap();

    let target_root = TempDir::new().unwrap();
    let target_dir = target_root.path().join("fresh");
    fs::create_dir(&target_dir).unwrap();
    write_file(&target_dir, "novel.txt", b"novel content");

    archive.analyze(&[target_dir.clone()], None).await.unwrap();

    assert!(read_record(&target_dir, "fresh").is_none());
    assert!(read_record(&target_dir, "fresh/novel.txt").is_none());
}
