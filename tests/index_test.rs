//! Indexing pipeline end-to-end: create → regex, modify → staleness-free,
//! idempotence, safety gates, orphan cleanup.

mod common;

use std::sync::Arc;

use chunkhound::config::IndexingConfig;
use chunkhound::indexing::{IndexingCoordinator, ProcessStatus};
use chunkhound::parser::ParserRegistry;
use common::*;

fn coordinator_with(store: Arc<chunkhound::StorageEngine>, config: IndexingConfig) -> IndexingCoordinator {
    IndexingCoordinator::new(store, Arc::new(ParserRegistry::new()), None, config)
}

#[tokio::test]
async fn test_create_then_regex_search() {
    let project = write_project(&[("t.py", "def TOKEN_A(): pass\n")]);
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    let result = coordinator
        .process_file(&project.path().join("t.py"), true)
        .await;
    assert_eq!(result.status, ProcessStatus::Success, "{:?}", result.error);
    assert!(result.chunks >= 1);

    let (rows, _) = store.search_regex("TOKEN_A", 10, 0, None).await.unwrap();
    assert!(!rows.is_empty());
    assert_eq!(rows[0].start_line, 1);
    assert!(rows[0].file_path.ends_with("t.py"));
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_modify_is_staleness_free() {
    let project = write_project(&[("m.py", "def TOKEN_B(): pass\n")]);
    let path = project.path().join("m.py");
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    let first = coordinator.process_file(&path, true).await;
    assert_eq!(first.status, ProcessStatus::Success);

    // Replace content; nudge mtime well past the epsilon.
    std::fs::write(&path, "def TOKEN_C(): pass\n# changed\n").unwrap();
    let bumped = filetime::now_plus_two_seconds();
    filetime::set_mtime(&path, bumped);

    let second = coordinator.process_file(&path, true).await;
    assert_eq!(second.status, ProcessStatus::Success);

    let (old_rows, _) = store.search_regex("TOKEN_B", 10, 0, None).await.unwrap();
    assert!(old_rows.is_empty(), "stale content must be gone");
    let (new_rows, _) = store.search_regex("TOKEN_C", 10, 0, None).await.unwrap();
    assert!(!new_rows.is_empty());
    store.disconnect().await.unwrap();
}

/// Minimal mtime helpers so the test does not depend on timestamp
/// granularity of the filesystem.
mod filetime {
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    pub fn now_plus_two_seconds() -> SystemTime {
        SystemTime::now() + Duration::from_secs(2)
    }

    pub fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}

#[tokio::test]
async fn test_reprocess_unchanged_is_noop() {
    let project = write_project(&[("u.py", "def stable_fn(): pass\n")]);
    let path = project.path().join("u.py");
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    let first = coordinator.process_file(&path, true).await;
    assert_eq!(first.status, ProcessStatus::Success);

    let canonical = dunce::canonicalize(&path).unwrap();
    let file = store
        .get_file_by_path(&canonical.to_string_lossy().replace('\\', "/"))
        .await
        .unwrap()
        .unwrap();
    let chunk_ids_before: Vec<i64> = store
        .get_chunks_by_file_id(file.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    let second = coordinator.process_file(&path, true).await;
    assert_eq!(second.status, ProcessStatus::UpToDate);

    let chunk_ids_after: Vec<i64> = store
        .get_chunks_by_file_id(file.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(chunk_ids_before, chunk_ids_after, "chunk rows must be untouched");
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_modify_then_revert_restores_chunks() {
    let project = write_project(&[("r.py", "def original_sym(): pass\n")]);
    let path = project.path().join("r.py");
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    coordinator.process_file(&path, true).await;

    std::fs::write(&path, "def replaced_sym(): pass\n").unwrap();
    filetime::set_mtime(&path, filetime::now_plus_two_seconds());
    coordinator.process_file(&path, true).await;

    std::fs::write(&path, "def original_sym(): pass\n").unwrap();
    filetime::set_mtime(
        &path,
        filetime::now_plus_two_seconds() + std::time::Duration::from_secs(2),
    );
    let result = coordinator.process_file(&path, true).await;
    assert_eq!(result.status, ProcessStatus::Success);

    let (rows, _) = store.search_regex("original_sym", 10, 0, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    let (gone, _) = store.search_regex("replaced_sym", 10, 0, None).await.unwrap();
    assert!(gone.is_empty());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_oversized_file_is_skipped() {
    let project = write_project(&[("big.py", "x = 1\n")]);
    let path = project.path().join("big.py");
    // Make it bigger than the 0 MB cap below would allow... use a 1-byte cap
    // via max_file_size_mb = 0.
    let (store, _db_dir) = temp_store().await;
    let config = IndexingConfig {
        max_file_size_mb: 0,
        ..Default::default()
    };
    let coordinator = coordinator_with(Arc::clone(&store), config);

    let result = coordinator.process_file(&path, true).await;
    assert_eq!(result.status, ProcessStatus::Skipped);
    assert_eq!(store.get_stats().await.unwrap().chunks, 0);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_large_structured_config_is_skipped() {
    let big_json = format!("{{\"items\": [{}]}}", "1,".repeat(30_000).trim_end_matches(','));
    let project = write_project(&[("data.json", big_json.as_str()), ("small.json", "{\"a\": 1}")]);
    let (store, _db_dir) = temp_store().await;
    // Threshold 20KB: data.json (~60KB) skips, small.json indexes.
    let coordinator = coordinator_for(Arc::clone(&store));

    let skipped = coordinator
        .process_file(&project.path().join("data.json"), true)
        .await;
    assert_eq!(skipped.status, ProcessStatus::Skipped);

    let indexed = coordinator
        .process_file(&project.path().join("small.json"), true)
        .await;
    assert_eq!(indexed.status, ProcessStatus::Success);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_missing_file_is_error() {
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));
    let result = coordinator
        .process_file(std::path::Path::new("/definitely/not/here.py"), true)
        .await;
    assert_eq!(result.status, ProcessStatus::Error);
    assert!(result.error.is_some());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_process_directory_collects_errors_and_continues() {
    let project = write_project(&[
        ("good1.py", "def g1(): pass\n"),
        ("good2.py", "def g2(): pass\n"),
        ("sub/good3.py", "def g3(): pass\n"),
    ]);
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    let report = coordinator
        .process_directory(project.path(), None, None)
        .await
        .unwrap();
    assert_eq!(report.files_processed, 3);
    assert_eq!(report.total_files, 3);
    assert!(report.total_chunks >= 3);
    assert!(report.errors.is_empty());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_orphan_cleanup_removes_deleted_files() {
    let project = write_project(&[
        ("stays.py", "def stays(): pass\n"),
        ("goes.py", "def goes(): pass\n"),
    ]);
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));

    coordinator
        .process_directory(project.path(), None, None)
        .await
        .unwrap();
    assert_eq!(store.get_stats().await.unwrap().files, 2);

    std::fs::remove_file(project.path().join("goes.py")).unwrap();
    let removed = coordinator.cleanup_orphans().await.unwrap();
    assert_eq!(removed, 1);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.files, 1);
    let (rows, _) = store.search_regex("goes", 10, 0, None).await.unwrap();
    assert!(rows.is_empty());
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_checksum_gate_populates_then_passes() {
    let project = write_project(&[("c.py", "def check_me(): pass\n")]);
    let path = project.path().join("c.py");
    let (store, _db_dir) = temp_store().await;
    let config = IndexingConfig {
        verify_checksum_when_mtime_equal: true,
        ..Default::default()
    };
    let coordinator = coordinator_with(Arc::clone(&store), config);

    let first = coordinator.process_file(&path, true).await;
    assert_eq!(first.status, ProcessStatus::Success);

    let canonical = dunce::canonicalize(&path).unwrap();
    let key = canonical.to_string_lossy().replace('\\', "/");
    let file = store.get_file_by_path(&key).await.unwrap().unwrap();
    assert!(file.checksum.is_some(), "first pass populates the checksum");

    let second = coordinator.process_file(&path, true).await;
    assert_eq!(second.status, ProcessStatus::UpToDate);
    store.disconnect().await.unwrap();
}
