use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Persistent vector collection — flat-file JSON storage, no external DB.
//
//  collection.json
//  {
//    "entries": {
//      "src/main.rs:0:0-42": {
//        "content": "...chunk text...",
//        "vector": [0.12, -0.03, ...],
//        "metadata": { "file_path": "src/main.rs", "start_line": 0, ... }
//      }
//    }
//  }
//
//  Inserts replace on duplicate chunk_id. Queries are a brute-force cosine
//  scan over all entries; distance is 1 − cosine so callers can recover
//  similarity as max(0, 1 − distance).
// ---------------------------------------------------------------------------

/// Retrieval metadata attached to every stored chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub chunk_index: u32,
    pub token_count: usize,
    pub chunk_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorRecord {
    content: String,
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    entries: HashMap<String, VectorRecord>,
}

/// Nearest-neighbour hits as parallel arrays, ordered by ascending distance.
#[derive(Debug, Clone, Default)]
pub struct QueryHits {
    pub ids: Vec<String>,
    pub contents: Vec<String>,
    pub metadatas: Vec<ChunkMetadata>,
    pub distances: Vec<f32>,
}

impl QueryHits {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct VectorStoreStats {
    pub total_chunks: u64,
}

pub struct VectorStore {
    collection_path: PathBuf,
    collection: Collection,
}

impl VectorStore {
    /// Open (or create) the collection directory and load the flat file.
    /// A corrupted or schema-incompatible file starts an empty collection;
    /// the indexer will repopulate it.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create vector store dir {}", dir.display()))?;

        let collection_path = dir.join("collection.json");
        let collection = match std::fs::read_to_string(&collection_path) {
            Ok(text) => match serde_json::from_str::<Collection>(&text) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "vector collection unreadable, starting empty");
                    Collection::default()
                }
            },
            Err(_) => Collection::default(),
        };

        Ok(Self {
            collection_path,
            collection,
        })
    }

    fn save(&self) -> Result<()> {
        let text = serde_json::to_string(&self.collection)?;
        std::fs::write(&self.collection_path, text).with_context(|| {
            format!(
                "Failed to persist vector collection {}",
                self.collection_path.display()
            )
        })
    }

    pub fn add(
        &mut self,
        chunk_id: &str,
        content: &str,
        vector: Vec<f32>,
        metadata: ChunkMetadata,
    ) -> Result<()> {
        self.collection.entries.insert(
            chunk_id.to_string(),
            VectorRecord {
                content: content.to_string(),
                vector,
                metadata,
            },
        );
        self.save()
    }

    /// Batch insert; replaces any existing record with the same chunk_id.
    /// The collection is persisted once, after the whole batch.
    pub fn add_many(
        &mut self,
        records: Vec<(String, String, Vec<f32>, ChunkMetadata)>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for (chunk_id, content, vector, metadata) in records {
            self.collection.entries.insert(
                chunk_id,
                VectorRecord {
                    content,
                    vector,
                    metadata,
                },
            );
        }
        self.save()
    }

    pub fn delete_by_id(&mut self, chunk_id: &str) -> Result<()> {
        if self.collection.entries.remove(chunk_id).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Remove every chunk whose metadata `file_path` matches.
    pub fn delete_by_file(&mut self, file_path: &str) -> Result<()> {
        let before = self.collection.entries.len();
        self.collection
            .entries
            .retain(|_, record| record.metadata.file_path != file_path);
        if self.collection.entries.len() != before {
            self.save()?;
        }
        Ok(())
    }

    /// Brute-force scan: score every entry, keep the `k` nearest.
    ///
    /// `file_filter`, when present, restricts hits to chunks whose metadata
    /// `file_path` is in the allow-list.
    pub fn query(&self, vector: &[f32], k: usize, file_filter: Option<&[String]>) -> QueryHits {
        let mut scored: Vec<(f32, &String, &VectorRecord)> = self
            .collection
            .entries
            .iter()
            .filter(|(_, record)| match file_filter {
                Some(allowed) => allowed.iter().any(|f| f == &record.metadata.file_path),
                None => true,
            })
            .map(|(id, record)| {
                let distance = 1.0 - cosine_similarity(vector, &record.vector);
                (distance, id, record)
            })
            .collect();

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        scored.truncate(k);

        let mut hits = QueryHits::default();
        for (distance, id, record) in scored {
            hits.ids.push(id.clone());
            hits.contents.push(record.content.clone());
            hits.metadatas.push(record.metadata.clone());
            hits.distances.push(distance);
        }
        hits
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.collection.entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> VectorStoreStats {
        VectorStoreStats {
            total_chunks: self.collection.entries.len() as u64,
        }
    }

    /// Destroy and recreate the collection.
    pub fn reset(&mut self) -> Result<()> {
        self.collection = Collection::default();
        self.save()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
