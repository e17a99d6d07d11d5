mod common;

use common::{open_indexer, stub_embedder, test_config, write_tree};
use std::collections::HashSet;
use std::path::Path;

use minipilot::config::{RootChangeAction, ABSOLUTE_MAX_FILE_BYTES};
use minipilot::indexer::Indexer;
use minipilot::merkle::merkle_root;
use minipilot::scanner::{scan_tree, ScanOptions};
use minipilot::store::MetadataStore;
use minipilot::vector_store::VectorStore;

fn open_stores(root: &Path) -> (MetadataStore, VectorStore) {
    let cache = root.join(".minipilot");
    (
        MetadataStore::open(&cache.join("cache.db")).unwrap(),
        VectorStore::open(&cache.join("vectors")).unwrap(),
    )
}

/// Cross-store invariants that must hold after every successful sync:
/// the persisted Merkle root matches the tracked files, every vector entry
/// has a chunk row and an embedding row, every chunk's file exists, and
/// chunk indices per file are contiguous from zero.
fn assert_consistent(root: &Path) {
    let (store, vectors) = open_stores(root);

    let merkle = store.get_merkle().unwrap().expect("merkle state persisted");
    let digests = store.all_file_digests().unwrap();
    assert_eq!(merkle_root(&digests), merkle.root_hash);
    assert_eq!(merkle.tree, digests);

    for id in vectors.all_ids() {
        let chunk = store
            .chunk_by_id(&id)
            .unwrap()
            .expect("vector entry has a chunk row");
        assert!(store.get_file(&chunk.file_path).unwrap().is_some());
        assert!(store.get_embedding(&id).unwrap().is_some());
    }

    for path in digests.keys() {
        let chunks = store.chunks_by_file(path).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index as usize, i);
        }
    }
}

#[test]
fn full_index_tracks_every_included_file() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("a.py", "def foo():\n    return 1\n"),
            ("lib/util.rs", "pub fn add(a: i32, b: i32) -> i32 { a + b }\n"),
            ("notes.bin", "binary-ish, wrong extension"),
        ],
    );

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    let report = indexer.full_index().unwrap();

    assert_eq!(report.total_files, 2);
    assert_eq!(report.processed_files, 2);
    assert_eq!(report.error_files, 0);
    assert_eq!(report.cache_stats.files, 2);
    assert!(report.cache_stats.chunks >= 2);
    assert_eq!(report.cache_stats.embeddings, report.vector_stats.total_chunks);
    drop(indexer);

    assert_consistent(dir.path());
}

#[test]
fn full_index_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("a.py", "def foo():\n    return 1\n"),
            ("b.py", "def bar():\n    return 2\n"),
        ],
    );

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    let first = indexer.full_index().unwrap();
    let (root_one, ids_one) = {
        let (store, vectors) = open_stores(dir.path());
        let mut ids: Vec<String> = vectors.all_ids();
        ids.sort();
        (store.get_merkle().unwrap().unwrap().root_hash, ids)
    };

    let second = indexer.full_index().unwrap();
    let (root_two, ids_two) = {
        let (store, vectors) = open_stores(dir.path());
        let mut ids: Vec<String> = vectors.all_ids();
        ids.sort();
        (store.get_merkle().unwrap().unwrap().root_hash, ids)
    };

    assert_eq!(root_one, root_two);
    assert_eq!(ids_one, ids_two);
    assert_eq!(first.cache_stats, second.cache_stats);
    drop(indexer);
    assert_consistent(dir.path());
}

#[test]
fn incremental_sync_on_unchanged_tree_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("a.py", "def foo():\n    return 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    indexer.full_index().unwrap();

    let before = {
        let (store, _) = open_stores(dir.path());
        (
            store.get_merkle().unwrap().unwrap().root_hash,
            store.chunks_by_file("a.py").unwrap(),
        )
    };

    let report = indexer.incremental_sync().unwrap();
    assert!(!report.changes_detected);
    assert_eq!(report.added_files, 0);
    assert_eq!(report.modified_files, 0);
    assert_eq!(report.deleted_files, 0);
    assert_eq!(report.processed_files, 0);

    let (store, _) = open_stores(dir.path());
    let merkle = store.get_merkle().unwrap().unwrap();
    assert_eq!(merkle.root_hash, before.0);

    let chunks_after = store.chunks_by_file("a.py").unwrap();
    let ids_before: Vec<&str> = before.1.iter().map(|c| c.id.as_str()).collect();
    let ids_after: Vec<&str> = chunks_after.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids_before, ids_after);
}

#[test]
fn modified_file_replaces_its_chunks_in_both_stores() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("a.py", "def foo():\n    return 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    indexer.full_index().unwrap();

    let old_ids: HashSet<String> = {
        let (store, _) = open_stores(dir.path());
        store
            .chunks_by_file("a.py")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    };
    assert!(!old_ids.is_empty());

    write_tree(dir.path(), &[("a.py", "def bar():\n    return 2\n")]);
    let report = indexer.incremental_sync().unwrap();
    assert!(report.changes_detected);
    assert_eq!(report.modified_files, 1);
    assert_eq!(report.processed_files, 1);
    drop(indexer);

    let (store, vectors) = open_stores(dir.path());
    let vector_ids: HashSet<String> = vectors.all_ids().into_iter().collect();
    for old_id in &old_ids {
        assert!(store.chunk_by_id(old_id).unwrap().is_none());
        assert!(store.get_embedding(old_id).unwrap().is_none());
        assert!(!vector_ids.contains(old_id));
    }

    let new_chunks = store.chunks_by_file("a.py").unwrap();
    assert!(!new_chunks.is_empty());
    assert!(new_chunks[0].content.contains("bar"));
    assert_consistent(dir.path());
}

#[test]
fn deleted_file_leaves_no_trace_and_empties_the_merkle_root() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("a.py", "def foo():\n    return 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    indexer.full_index().unwrap();

    std::fs::remove_file(dir.path().join("a.py")).unwrap();
    let report = indexer.incremental_sync().unwrap();
    assert!(report.changes_detected);
    assert_eq!(report.deleted_files, 1);
    drop(indexer);

    let (store, vectors) = open_stores(dir.path());
    assert!(store.get_file("a.py").unwrap().is_none());
    assert!(store.chunks_by_file("a.py").unwrap().is_empty());
    assert!(vectors.all_ids().is_empty());
    assert_eq!(store.get_merkle().unwrap().unwrap().root_hash, "");
    assert_eq!(store.stats().unwrap().files, 0);
}

#[test]
fn rename_is_delete_plus_add_with_identical_content_hash() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("a.py", "def foo():\n    return 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    indexer.full_index().unwrap();

    let (old_hash, old_chunk_count) = {
        let (store, _) = open_stores(dir.path());
        (
            store.get_file("a.py").unwrap().unwrap().content_hash,
            store.stats().unwrap().chunks,
        )
    };

    std::fs::rename(dir.path().join("a.py"), dir.path().join("b.py")).unwrap();
    let report = indexer.incremental_sync().unwrap();
    assert_eq!(report.added_files, 1);
    assert_eq!(report.deleted_files, 1);
    drop(indexer);

    let (store, _) = open_stores(dir.path());
    assert!(store.get_file("a.py").unwrap().is_none());
    let renamed = store.get_file("b.py").unwrap().unwrap();
    assert_eq!(renamed.content_hash, old_hash);
    assert_eq!(store.stats().unwrap().chunks, old_chunk_count);
    assert_consistent(dir.path());
}

#[test]
fn empty_tree_indexes_to_an_empty_root_and_zero_chunks() {
    let dir = tempfile::tempdir().unwrap();

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    let report = indexer.full_index().unwrap();

    assert_eq!(report.total_files, 0);
    assert_eq!(report.cache_stats.chunks, 0);
    drop(indexer);

    let (store, _) = open_stores(dir.path());
    assert_eq!(store.get_merkle().unwrap().unwrap().root_hash, "");
}

#[test]
fn size_boundary_is_inclusive_at_one_mebibyte() {
    let dir = tempfile::tempdir().unwrap();
    let line = "x".repeat(63) + "\n"; // 64 bytes
    let at_limit = line.repeat((ABSOLUTE_MAX_FILE_BYTES / 64) as usize);
    assert_eq!(at_limit.len() as u64, ABSOLUTE_MAX_FILE_BYTES);
    let over_limit = at_limit.clone() + "y";
    write_tree(
        dir.path(),
        &[("exact.txt", at_limit.as_str()), ("over.txt", over_limit.as_str())],
    );

    let entries = scan_tree(&ScanOptions {
        root: dir.path().to_path_buf(),
        max_file_bytes: ABSOLUTE_MAX_FILE_BYTES,
    })
    .unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
    assert_eq!(names, vec!["exact.txt"]);
}

#[test]
fn unreadable_files_count_as_errors_and_stay_untracked() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("ok.py", "x = 1\n")]);
    // Invalid UTF-8 under an allowed extension: the walker admits it, the
    // loader rejects it.
    std::fs::write(dir.path().join("broken.py"), [0xff, 0xfe, 0x00, 0x41]).unwrap();

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    let report = indexer.full_index().unwrap();

    assert_eq!(report.total_files, 2);
    assert_eq!(report.processed_files, 1);
    assert_eq!(report.error_files, 1);
    drop(indexer);

    let (store, _) = open_stores(dir.path());
    assert!(store.get_file("broken.py").unwrap().is_none());
    assert_consistent(dir.path());
}

#[test]
fn root_change_policy_refuses_or_clears_a_shared_cache() {
    let cache = tempfile::tempdir().unwrap();
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();
    write_tree(root_a.path(), &[("a.py", "alpha = 1\n")]);
    write_tree(root_b.path(), &[("b.py", "beta = 2\n")]);

    let mut cfg = test_config();
    cfg.cache_dir = cache.path().to_path_buf();

    let embedder = stub_embedder();
    let mut cfg_refuse = cfg.clone();
    cfg_refuse.on_root_change = RootChangeAction::Refuse;

    Indexer::open(root_a.path(), cfg_refuse.clone(), embedder.clone())
        .unwrap()
        .full_index()
        .unwrap();

    // Same cache, different root: refuse.
    let mut refused = Indexer::open(root_b.path(), cfg_refuse, embedder.clone()).unwrap();
    assert!(refused.full_index().is_err());

    // With the clear policy the cache is wiped and rebuilt for the new root.
    let mut cfg_clear = cfg;
    cfg_clear.on_root_change = RootChangeAction::Clear;
    let mut cleared = Indexer::open(root_b.path(), cfg_clear, embedder).unwrap();
    let report = cleared.full_index().unwrap();
    assert_eq!(report.total_files, 1);

    let store = MetadataStore::open(&cache.path().join("cache.db")).unwrap();
    assert!(store.get_file("a.py").unwrap().is_none());
    assert!(store.get_file("b.py").unwrap().is_some());
}

#[test]
fn zero_chunk_files_stay_tracked_so_the_merkle_map_matches() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("empty.py", ""), ("real.py", "x = 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    let report = indexer.full_index().unwrap();
    assert_eq!(report.processed_files, 2);
    drop(indexer);

    let (store, _) = open_stores(dir.path());
    assert!(store.get_file("empty.py").unwrap().is_some());
    assert!(store.chunks_by_file("empty.py").unwrap().is_empty());
    assert_consistent(dir.path());
}

#[test]
fn status_reflects_the_committed_index() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("a.py", "def foo():\n    return 1\n")]);

    let embedder = stub_embedder();
    let mut indexer = open_indexer(dir.path(), embedder);
    indexer.full_index().unwrap();

    let status = indexer.status().unwrap();
    assert_eq!(status.cache_stats.files, 1);
    assert_eq!(status.embedding_model.as_deref(), Some("stub-bag-of-tokens"));
    assert!(status.merkle_root.is_some());
    assert!(status.last_sync.is_some());
}
