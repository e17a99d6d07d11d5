use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::chunker::Chunk;

/// Tracked source file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_path: String,
    pub content_hash: String,
    pub last_modified: String,
    pub file_size: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored embedding row. The vector is serialised as a JSON array string.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub created_at: String,
}

/// The Merkle singleton: root digest plus the full path→digest map.
#[derive(Debug, Clone)]
pub struct MerkleRecord {
    pub root_hash: String,
    pub tree: BTreeMap<String, String>,
    pub last_sync: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub files: u64,
    pub chunks: u64,
    pub embeddings: u64,
}

/// Single-file SQLite store for file, chunk, embedding, Merkle and indexer
/// metadata. One writer at a time; readers may open their own handle.
pub struct MetadataStore {
    conn: Connection,
    path: PathBuf,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache dir {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open metadata store {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = OFF;",
        )
        .context("Failed to apply pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT UNIQUE NOT NULL,
                content_hash TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id TEXT UNIQUE NOT NULL,
                file_path TEXT NOT NULL,
                content TEXT NOT NULL,
                chunk_hash TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (file_path) REFERENCES files (file_path)
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id TEXT UNIQUE NOT NULL,
                embedding_vector TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (chunk_id) REFERENCES chunks (chunk_id)
            );

            CREATE TABLE IF NOT EXISTS merkle_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                root_hash TEXT NOT NULL,
                tree_data TEXT NOT NULL,
                last_sync TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS indexer_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                root_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_files_path ON files(file_path);
            CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);
            CREATE INDEX IF NOT EXISTS idx_chunks_chunk_id ON chunks(chunk_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_chunk_id ON embeddings(chunk_id);",
        )
        .context("Failed to initialise metadata schema")?;

        Ok(Self {
            conn,
            path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    // ── files ─────────────────────────────────────────────────────────────

    pub fn upsert_file(
        &mut self,
        file_path: &str,
        content_hash: &str,
        last_modified: DateTime<Utc>,
        file_size: u64,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO files (file_path, content_hash, last_modified, file_size, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(file_path) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 last_modified = excluded.last_modified,
                 file_size = excluded.file_size,
                 updated_at = excluded.updated_at",
            params![
                file_path,
                content_hash,
                last_modified.to_rfc3339(),
                file_size as i64,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, file_path: &str) -> Result<Option<FileRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT file_path, content_hash, last_modified, file_size, created_at, updated_at
                 FROM files WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok(FileRecord {
                        file_path: row.get(0)?,
                        content_hash: row.get(1)?,
                        last_modified: row.get(2)?,
                        file_size: row.get::<_, i64>(3)? as u64,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn all_file_digests(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path, content_hash FROM files")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut digests = BTreeMap::new();
        for row in rows {
            let (path, digest): (String, String) = row?;
            digests.insert(path, digest);
        }
        Ok(digests)
    }

    // ── chunks ────────────────────────────────────────────────────────────

    /// Insert or replace a batch of chunks in one transaction.
    pub fn upsert_chunks(&mut self, chunks: &[Chunk]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                 (chunk_id, file_path, content, chunk_hash, start_line, end_line, chunk_index, token_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id,
                    chunk.file_path,
                    chunk.content,
                    chunk.hash,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                    chunk.chunk_index as i64,
                    chunk.token_count as i64,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn chunks_by_file(&self, file_path: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, file_path, content, chunk_hash, start_line, end_line, chunk_index, token_count
             FROM chunks WHERE file_path = ?1
             ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![file_path], row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    pub fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let chunk = self
            .conn
            .query_row(
                "SELECT chunk_id, file_path, content, chunk_hash, start_line, end_line, chunk_index, token_count
                 FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    pub fn all_chunk_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT chunk_id FROM chunks")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    // ── embeddings ────────────────────────────────────────────────────────

    pub fn upsert_embedding(&mut self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()> {
        let serialised = serde_json::to_string(vector)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, embedding_vector, embedding_model, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![chunk_id, serialised, model, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, chunk_id: &str) -> Result<Option<EmbeddingRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT chunk_id, embedding_vector, embedding_model, created_at
                 FROM embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((chunk_id, serialised, model, created_at)) => Ok(Some(EmbeddingRecord {
                chunk_id,
                vector: serde_json::from_str(&serialised)
                    .context("Corrupt embedding vector in store")?,
                model,
                created_at,
            })),
        }
    }

    /// The model id recorded on stored embeddings, if any exist.
    pub fn embedding_model(&self) -> Result<Option<String>> {
        let model = self
            .conn
            .query_row(
                "SELECT DISTINCT embedding_model FROM embeddings LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(model)
    }

    // ── merkle state ──────────────────────────────────────────────────────

    pub fn upsert_merkle(&mut self, root_hash: &str, tree: &BTreeMap<String, String>) -> Result<()> {
        let tree_data = serde_json::to_string(tree)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO merkle_state (id, root_hash, tree_data, last_sync)
             VALUES (1, ?1, ?2, ?3)",
            params![root_hash, tree_data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_merkle(&self) -> Result<Option<MerkleRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT root_hash, tree_data, last_sync FROM merkle_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((root_hash, tree_data, last_sync)) => Ok(Some(MerkleRecord {
                root_hash,
                tree: serde_json::from_str(&tree_data).context("Corrupt merkle tree in store")?,
                last_sync,
            })),
        }
    }

    // ── indexer metadata ──────────────────────────────────────────────────

    pub fn upsert_indexed_root(&mut self, root_path: &Path) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO indexer_metadata (id, root_path, created_at, updated_at)
             VALUES (1, ?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET
                 root_path = excluded.root_path,
                 updated_at = excluded.updated_at",
            params![root_path.to_string_lossy(), now],
        )?;
        Ok(())
    }

    pub fn indexed_root(&self) -> Result<Option<PathBuf>> {
        let path: Option<String> = self
            .conn
            .query_row(
                "SELECT root_path FROM indexer_metadata WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    // ── maintenance ───────────────────────────────────────────────────────

    /// Delete embeddings, chunks and the file row for one path, atomically.
    pub fn delete_file_data(&mut self, file_path: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM embeddings
             WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE file_path = ?1)",
            params![file_path],
        )?;
        tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])?;
        tx.execute("DELETE FROM files WHERE file_path = ?1", params![file_path])?;
        tx.commit()?;
        Ok(())
    }

    /// Remove embeddings whose chunk is gone and chunks whose file is gone.
    /// Returns (deleted_embeddings, deleted_chunks).
    pub fn cleanup_orphans(&mut self) -> Result<(usize, usize)> {
        let tx = self.conn.transaction()?;
        let embeddings = tx.execute(
            "DELETE FROM embeddings WHERE chunk_id NOT IN (SELECT chunk_id FROM chunks)",
            [],
        )?;
        let chunks = tx.execute(
            "DELETE FROM chunks WHERE file_path NOT IN (SELECT file_path FROM files)",
            [],
        )?;
        tx.commit()?;

        if embeddings + chunks > 0 {
            tracing::debug!(embeddings, chunks, "removed orphaned rows");
        }
        Ok((embeddings, chunks))
    }

    pub fn clear_all(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM embeddings;
             DELETE FROM chunks;
             DELETE FROM files;
             DELETE FROM merkle_state;
             DELETE FROM indexer_metadata;",
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            files: count("SELECT COUNT(*) FROM files")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
        })
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        file_path: row.get(1)?,
        content: row.get(2)?,
        hash: row.get(3)?,
        start_line: row.get::<_, i64>(4)? as u32,
        end_line: row.get::<_, i64>(5)? as u32,
        chunk_index: row.get::<_, i64>(6)? as u32,
        token_count: row.get::<_, i64>(7)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("cache.db")).unwrap();
        (dir, store)
    }

    fn chunk(id: &str, file: &str, index: u32) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: file.to_string(),
            content: format!("content of {id}"),
            hash: "h".repeat(64),
            start_line: index * 10,
            end_line: index * 10 + 5,
            chunk_index: index,
            token_count: 42,
        }
    }

    #[test]
    fn file_upsert_replaces_and_preserves_created_at() {
        let (_dir, mut store) = temp_store();
        store.upsert_file("a.py", "digest1", Utc::now(), 10).unwrap();
        let first = store.get_file("a.py").unwrap().unwrap();

        store.upsert_file("a.py", "digest2", Utc::now(), 20).unwrap();
        let second = store.get_file("a.py").unwrap().unwrap();

        assert_eq!(second.content_hash, "digest2");
        assert_eq!(second.file_size, 20);
        assert_eq!(second.created_at, first.created_at);

        let digests = store.all_file_digests().unwrap();
        assert_eq!(digests.get("a.py").map(String::as_str), Some("digest2"));
    }

    #[test]
    fn chunks_round_trip_ordered_by_index() {
        let (_dir, mut store) = temp_store();
        store.upsert_file("a.py", "d", Utc::now(), 1).unwrap();
        store
            .upsert_chunks(&[chunk("a.py:1:10-15", "a.py", 1), chunk("a.py:0:0-5", "a.py", 0)])
            .unwrap();

        let chunks = store.chunks_by_file("a.py").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);

        let by_id = store.chunk_by_id("a.py:0:0-5").unwrap().unwrap();
        assert_eq!(by_id.token_count, 42);
        assert!(store.chunk_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn embeddings_round_trip_as_json_vectors() {
        let (_dir, mut store) = temp_store();
        store.upsert_file("a.py", "d", Utc::now(), 1).unwrap();
        store.upsert_chunks(&[chunk("c1", "a.py", 0)]).unwrap();
        store.upsert_embedding("c1", &[0.25, -1.5, 3.0], "test-model").unwrap();

        let rec = store.get_embedding("c1").unwrap().unwrap();
        assert_eq!(rec.vector, vec![0.25, -1.5, 3.0]);
        assert_eq!(rec.model, "test-model");
        assert_eq!(store.embedding_model().unwrap().as_deref(), Some("test-model"));
    }

    #[test]
    fn delete_file_data_cascades_in_one_call() {
        let (_dir, mut store) = temp_store();
        store.upsert_file("a.py", "d", Utc::now(), 1).unwrap();
        store.upsert_chunks(&[chunk("c1", "a.py", 0), chunk("c2", "a.py", 1)]).unwrap();
        store.upsert_embedding("c1", &[1.0], "m").unwrap();

        store.delete_file_data("a.py").unwrap();

        assert!(store.get_file("a.py").unwrap().is_none());
        assert!(store.chunks_by_file("a.py").unwrap().is_empty());
        assert!(store.get_embedding("c1").unwrap().is_none());
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn cleanup_orphans_removes_dangling_rows() {
        let (_dir, mut store) = temp_store();
        store.upsert_file("kept.py", "d", Utc::now(), 1).unwrap();
        store.upsert_chunks(&[chunk("kept", "kept.py", 0), chunk("dangling", "gone.py", 0)]).unwrap();
        store.upsert_embedding("kept", &[1.0], "m").unwrap();
        store.upsert_embedding("no-chunk", &[1.0], "m").unwrap();

        let (embeddings, chunks) = store.cleanup_orphans().unwrap();
        assert_eq!(embeddings, 1);
        assert_eq!(chunks, 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.embeddings, 1);
    }

    #[test]
    fn merkle_singleton_overwrites() {
        let (_dir, mut store) = temp_store();
        assert!(store.get_merkle().unwrap().is_none());

        let mut tree = BTreeMap::new();
        tree.insert("a.py".to_string(), "d1".to_string());
        store.upsert_merkle("root1", &tree).unwrap();

        tree.insert("b.py".to_string(), "d2".to_string());
        store.upsert_merkle("root2", &tree).unwrap();

        let rec = store.get_merkle().unwrap().unwrap();
        assert_eq!(rec.root_hash, "root2");
        assert_eq!(rec.tree.len(), 2);
    }

    #[test]
    fn indexed_root_round_trips_and_clear_all_wipes_everything() {
        let (_dir, mut store) = temp_store();
        store.upsert_indexed_root(Path::new("/work/project")).unwrap();
        assert_eq!(store.indexed_root().unwrap(), Some(PathBuf::from("/work/project")));

        store.upsert_file("a.py", "d", Utc::now(), 1).unwrap();
        store.upsert_merkle("root", &BTreeMap::new()).unwrap();
        store.clear_all().unwrap();

        assert!(store.indexed_root().unwrap().is_none());
        assert!(store.get_merkle().unwrap().is_none());
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }
}
