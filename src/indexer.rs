use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunker::{load_file_content, sha256_hex, Chunker};
use crate::config::{Config, RootChangeAction};
use crate::embedder::{instruction_for_path, Embedder};
use crate::merkle::{diff_trees, merkle_root};
use crate::scanner::{scan_tree, FileEntry, ScanOptions};
use crate::store::{MetadataStore, StoreStats};
use crate::vector_store::{ChunkMetadata, VectorStore, VectorStoreStats};

/// Outcome of processing one file. `Processed` and `Skipped` carry the
/// content digest that now describes the file, for the Merkle commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Processed { digest: String },
    Skipped { digest: String },
    /// Read or decode failure; the file drops out of this sync entirely.
    Unreadable,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub total_files: usize,
    pub processed_files: usize,
    pub skipped_files: usize,
    pub error_files: usize,
    pub cache_stats: StoreStats,
    pub vector_stats: VectorStoreStats,
    pub last_sync: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub changes_detected: bool,
    pub added_files: usize,
    pub modified_files: usize,
    pub deleted_files: usize,
    pub processed_files: usize,
    pub error_files: usize,
    pub cache_stats: StoreStats,
    pub vector_stats: VectorStoreStats,
    pub last_sync: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_stats: StoreStats,
    pub vector_stats: VectorStoreStats,
    pub embedding_model: Option<String>,
    pub merkle_root: Option<String>,
    pub last_sync: Option<String>,
}

/// Build a status report from already-open store handles; used both by
/// [`Indexer::status`] and by callers that have no embedder loaded.
pub fn status_report(
    root: &Path,
    cache_dir: &Path,
    store: &MetadataStore,
    vectors: &VectorStore,
) -> Result<StatusReport> {
    let merkle = store.get_merkle()?;
    Ok(StatusReport {
        root: root.to_path_buf(),
        cache_dir: cache_dir.to_path_buf(),
        cache_stats: store.stats()?,
        vector_stats: vectors.stats(),
        embedding_model: store.embedding_model()?,
        merkle_root: merkle.as_ref().map(|m| m.root_hash.clone()),
        last_sync: merkle.map(|m| m.last_sync),
    })
}

/// Single-writer orchestrator over the walker, chunker, embedder and both
/// stores. Per-file failures are folded into the returned reports; store
/// write failures abort the sync before the Merkle state is committed, so
/// the next run reattempts the unfinished files.
pub struct Indexer {
    root: PathBuf,
    cache_dir: PathBuf,
    config: Config,
    chunker: Chunker,
    store: MetadataStore,
    vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
}

impl Indexer {
    pub fn open(root: &Path, config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Root does not exist: {}", root.display()))?;
        let cache_dir = config.cache_dir_under(&root);

        let store = MetadataStore::open(&cache_dir.join("cache.db"))?;
        let vectors = VectorStore::open(&cache_dir.join("vectors"))?;
        let chunker = Chunker::new(config.chunker.chunk_size, config.chunker.chunk_overlap);

        Ok(Self {
            root,
            cache_dir,
            config,
            chunker,
            store,
            vectors,
            embedder,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── path-change detection ─────────────────────────────────────────────

    /// The previously indexed root, when it differs from the current one and
    /// the cache actually holds data.
    pub fn root_change(&self) -> Result<Option<PathBuf>> {
        let Some(prior) = self.store.indexed_root()? else {
            return Ok(None);
        };
        if prior == self.root {
            return Ok(None);
        }
        if self.store.stats()?.files == 0 {
            return Ok(None);
        }
        Ok(Some(prior))
    }

    /// Wipe both stores. Used when the tree the index was built for is gone.
    pub fn clear_all_state(&mut self) -> Result<()> {
        self.store.clear_all()?;
        self.vectors.reset()?;
        info!("cleared metadata and vector stores");
        Ok(())
    }

    fn ensure_root_consistent(&mut self) -> Result<()> {
        let Some(prior) = self.root_change()? else {
            return Ok(());
        };
        match self.config.on_root_change {
            RootChangeAction::Clear => {
                info!(
                    prior = %prior.display(),
                    current = %self.root.display(),
                    "indexed root changed, clearing stores"
                );
                self.clear_all_state()
            }
            // Prompting is an interactive concern; anything non-interactive
            // that reaches this point refuses.
            RootChangeAction::Refuse | RootChangeAction::Prompt => bail!(
                "index was built for {} but the current root is {}; \
                 clear the cache or rerun with on_root_change = \"clear\"",
                prior.display(),
                self.root.display()
            ),
        }
    }

    // ── per-file processing ───────────────────────────────────────────────

    /// Reindex one file. With `force` off, an unchanged content digest is a
    /// no-op. Replace semantics: old chunks and embeddings are removed from
    /// both stores before the new records land, so chunk IDs from older
    /// chunker parameters can never linger.
    pub fn process_file(&mut self, entry: &FileEntry, force: bool) -> Result<FileOutcome> {
        let rel_path = entry.rel_path.as_str();

        let Some(content) = load_file_content(&entry.abs_path) else {
            debug!(file = rel_path, "unreadable, skipping");
            return Ok(FileOutcome::Unreadable);
        };
        let digest = sha256_hex(&content);

        if !force {
            if let Some(stored) = self.store.get_file(rel_path)? {
                if stored.content_hash == digest {
                    return Ok(FileOutcome::Skipped { digest });
                }
            }
        }

        let chunks = self.chunker.chunk_text(&content, rel_path);

        self.store.delete_file_data(rel_path)?;
        self.vectors.delete_by_file(rel_path)?;

        let mtime = std::fs::metadata(&entry.abs_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        self.store
            .upsert_file(rel_path, &digest, mtime, content.len() as u64)?;

        if chunks.is_empty() {
            // The file stays tracked so the stored digest map matches the
            // walked tree; it just contributes nothing searchable.
            debug!(file = rel_path, "no chunks produced");
            return Ok(FileOutcome::Processed { digest });
        }

        self.store.upsert_chunks(&chunks)?;

        let instruction = instruction_for_path(rel_path);
        let model_id = self.embedder.model_id().to_string();
        let mut vector_records = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            // A failed embedding leaves the chunk searchable by nothing: the
            // metadata row exists, the vector is absent, and the next forced
            // run of this file retries. Zero vectors would poison the space.
            match self.embedder.embed(&chunk.content, Some(instruction)) {
                Ok(vector) => {
                    self.store.upsert_embedding(&chunk.id, &vector, &model_id)?;
                    vector_records.push((
                        chunk.id.clone(),
                        chunk.content.clone(),
                        vector,
                        ChunkMetadata {
                            file_path: chunk.file_path.clone(),
                            start_line: chunk.start_line,
                            end_line: chunk.end_line,
                            chunk_index: chunk.chunk_index,
                            token_count: chunk.token_count,
                            chunk_hash: chunk.hash.clone(),
                        },
                    ));
                }
                Err(e) => {
                    warn!(file = rel_path, chunk = %chunk.id, error = %e, "embedding failed");
                }
            }
        }
        self.vectors.add_many(vector_records)?;

        debug!(file = rel_path, chunks = chunks.len(), "indexed");
        Ok(FileOutcome::Processed { digest })
    }

    // ── sync entry points ─────────────────────────────────────────────────

    pub fn full_index(&mut self) -> Result<IndexReport> {
        self.full_index_with_progress(|_, _| {})
    }

    /// Reprocess every included file unconditionally. `on_progress` receives
    /// (files done, files total) after each file.
    pub fn full_index_with_progress(
        &mut self,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<IndexReport> {
        self.ensure_root_consistent()?;
        self.store.upsert_indexed_root(&self.root)?;

        let entries = self.scan()?;
        let total_files = entries.len();
        info!(files = total_files, root = %self.root.display(), "full index");

        let mut tree = BTreeMap::new();
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut errors = 0usize;

        for (done, entry) in entries.iter().enumerate() {
            match self.process_file(entry, true)? {
                FileOutcome::Processed { digest } => {
                    tree.insert(entry.rel_path.clone(), digest);
                    processed += 1;
                }
                FileOutcome::Skipped { digest } => {
                    tree.insert(entry.rel_path.clone(), digest);
                    skipped += 1;
                }
                FileOutcome::Unreadable => errors += 1,
            }
            on_progress(done + 1, total_files);
        }

        // Tracked files the walk no longer produced (deleted, excluded, or
        // newly unreadable) must leave the stores, or the committed Merkle
        // map would disagree with them.
        let stale: Vec<String> = self
            .store
            .all_file_digests()?
            .into_keys()
            .filter(|path| !tree.contains_key(path))
            .collect();
        for rel_path in &stale {
            self.store.delete_file_data(rel_path)?;
            self.vectors.delete_by_file(rel_path)?;
        }

        let root_hash = merkle_root(&tree);
        self.store.upsert_merkle(&root_hash, &tree)?;

        self.store.cleanup_orphans()?;
        self.reconcile_vector_store()?;

        info!(processed, skipped, errors, "full index complete");
        Ok(IndexReport {
            total_files,
            processed_files: processed,
            skipped_files: skipped,
            error_files: errors,
            cache_stats: self.store.stats()?,
            vector_stats: self.vectors.stats(),
            last_sync: Utc::now().to_rfc3339(),
        })
    }

    pub fn incremental_sync(&mut self) -> Result<SyncReport> {
        self.incremental_sync_with_progress(|_, _| {})
    }

    /// Reprocess only files whose content digest changed since the persisted
    /// Merkle state, plus additions and deletions.
    pub fn incremental_sync_with_progress(
        &mut self,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<SyncReport> {
        self.ensure_root_consistent()?;

        let entries = self.scan()?;
        let mut current = self.digest_sweep(&entries);
        let prior = self
            .store
            .get_merkle()?
            .map(|m| m.tree)
            .unwrap_or_default();

        let diff = diff_trees(&prior, &current);

        if diff.is_empty() {
            // Nothing moved: refresh the Merkle timestamp and stop. No other
            // rows are touched, so a no-op sync really is a no-op.
            let root_hash = merkle_root(&current);
            self.store.upsert_merkle(&root_hash, &current)?;
            debug!("incremental sync: no changes");
            return Ok(SyncReport {
                changes_detected: false,
                added_files: 0,
                modified_files: 0,
                deleted_files: 0,
                processed_files: 0,
                error_files: 0,
                cache_stats: self.store.stats()?,
                vector_stats: self.vectors.stats(),
                last_sync: Utc::now().to_rfc3339(),
            });
        }

        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            "incremental sync"
        );

        for rel_path in &diff.deleted {
            self.store.delete_file_data(rel_path)?;
            self.vectors.delete_by_file(rel_path)?;
        }

        let by_path: BTreeMap<&str, &FileEntry> = entries
            .iter()
            .map(|e| (e.rel_path.as_str(), e))
            .collect();

        let to_process: Vec<&str> = diff
            .added
            .iter()
            .chain(diff.modified.iter())
            .map(String::as_str)
            .collect();
        let total = to_process.len();

        let mut processed = 0usize;
        let mut errors = 0usize;
        for (done, rel_path) in to_process.into_iter().enumerate() {
            let Some(entry) = by_path.get(rel_path) else {
                // Vanished between the sweep and now; it must not survive in
                // the committed Merkle map.
                current.remove(rel_path);
                continue;
            };
            match self.process_file(entry, true)? {
                FileOutcome::Processed { digest } | FileOutcome::Skipped { digest } => {
                    // The file may have changed between the digest sweep and
                    // now; the Merkle map must describe what was stored.
                    current.insert(rel_path.to_string(), digest);
                    processed += 1;
                }
                FileOutcome::Unreadable => {
                    // Any rows from the file's previous life would disagree
                    // with the Merkle map it just dropped out of.
                    self.store.delete_file_data(rel_path)?;
                    self.vectors.delete_by_file(rel_path)?;
                    current.remove(rel_path);
                    errors += 1;
                }
            }
            on_progress(done + 1, total);
        }

        let root_hash = merkle_root(&current);
        self.store.upsert_merkle(&root_hash, &current)?;

        self.store.cleanup_orphans()?;
        self.reconcile_vector_store()?;

        info!(processed, errors, "incremental sync complete");
        Ok(SyncReport {
            changes_detected: true,
            added_files: diff.added.len(),
            modified_files: diff.modified.len(),
            deleted_files: diff.deleted.len(),
            processed_files: processed,
            error_files: errors,
            cache_stats: self.store.stats()?,
            vector_stats: self.vectors.stats(),
            last_sync: Utc::now().to_rfc3339(),
        })
    }

    pub fn status(&self) -> Result<StatusReport> {
        status_report(&self.root, &self.cache_dir, &self.store, &self.vectors)
    }

    // ── helpers ───────────────────────────────────────────────────────────

    fn scan(&self) -> Result<Vec<FileEntry>> {
        scan_tree(&ScanOptions {
            root: self.root.clone(),
            max_file_bytes: self.config.max_file_bytes(),
        })
    }

    /// Current path→digest map. Reads and hashes in parallel; files that
    /// disappear or fail to decode mid-sweep simply drop out.
    fn digest_sweep(&self, entries: &[FileEntry]) -> BTreeMap<String, String> {
        entries
            .par_iter()
            .filter_map(|entry| {
                let content = load_file_content(&entry.abs_path)?;
                Some((entry.rel_path.clone(), sha256_hex(&content)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }

    /// Drop vector-store entries whose chunk no longer exists in the
    /// metadata store. The two stores are not transactionally coupled, so a
    /// crash between writes can leave strays; this pass bounds the drift to
    /// one sync.
    fn reconcile_vector_store(&mut self) -> Result<()> {
        let known = self.store.all_chunk_ids()?;
        let mut strays = 0usize;
        for id in self.vectors.all_ids() {
            if !known.contains(&id) {
                self.vectors.delete_by_id(&id)?;
                strays += 1;
            }
        }
        if strays > 0 {
            debug!(strays, "removed vector entries with no metadata row");
        }
        Ok(())
    }
}
