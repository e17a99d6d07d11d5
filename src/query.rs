use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{Config, QueryConfig};
use crate::embedder::{Embedder, QUERY_INSTRUCTION};
use crate::store::MetadataStore;
use crate::vector_store::{ChunkMetadata, VectorStore};

/// English filler words excluded from keyword boosting.
const STOP_WORDS: &[&str] = &[
    "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "from", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did",
    "will", "would", "could", "should", "may", "might", "can", "what", "who", "where", "when",
    "why", "how", "this", "that", "these", "those", "there", "here", "it", "they",
];

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub content: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub similarity_score: f32,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub search_time_ms: f64,
    pub context_summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub query: String,
    pub context: String,
    pub context_length: usize,
    pub chunks_used: usize,
    pub total_chunks_found: usize,
    pub search_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeExplanation {
    pub target_code: String,
    pub file_path: String,
    pub line_range: String,
    pub related_chunks: Vec<SearchResult>,
    pub context_summary: String,
}

/// Read-side engine over committed index state. Opens its own store handles
/// so it can run while an indexer owns the write side.
pub struct QueryEngine {
    store: MetadataStore,
    vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(
        store: MetadataStore,
        vectors: VectorStore,
        embedder: Arc<dyn Embedder>,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            config,
        }
    }

    /// Open against the cache directory layout the indexer writes.
    pub fn open(root: &Path, config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let cache_dir = config.cache_dir_under(root);
        let store = MetadataStore::open(&cache_dir.join("cache.db"))?;
        let vectors = VectorStore::open(&cache_dir.join("vectors"))?;
        Ok(Self::new(store, vectors, embedder, config.query.clone()))
    }

    /// Stored embeddings are only comparable to queries embedded by the same
    /// model; searching across models silently returns garbage, so refuse.
    fn ensure_model_matches(&self) -> Result<()> {
        if let Some(stored) = self.store.embedding_model()? {
            if stored != self.embedder.model_id() {
                bail!(
                    "index was embedded with {stored} but the active model is {}; \
                     reindex or switch models",
                    self.embedder.model_id()
                );
            }
        }
        Ok(())
    }

    pub fn search(
        &self,
        query: &str,
        file_filter: Option<&[String]>,
        max_results: Option<usize>,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        self.ensure_model_matches()?;

        let max_results = max_results.unwrap_or(self.config.max_results);

        let query_vector = match self.embedder.embed(query, Some(QUERY_INSTRUCTION)) {
            Ok(v) => v,
            Err(e) => {
                // Degrade to empty rather than failing the caller; the
                // indexer logs will show what broke.
                warn!(error = %e, "query embedding failed");
                return Ok(empty_response(query, started));
            }
        };

        // Overfetch so boosting can promote hits past the raw top-K cut.
        let hits = self
            .vectors
            .query(&query_vector, max_results * 2, file_filter);
        let keywords = extract_keywords(query);

        let mut results = Vec::with_capacity(hits.len());
        for i in 0..hits.len() {
            let distance = hits.distances[i];
            let base = (1.0 - distance).max(0.0);
            let boosted = apply_keyword_boost(base, &hits.contents[i], &keywords);
            if boosted < self.config.similarity_threshold {
                continue;
            }
            let metadata = hits.metadatas[i].clone();
            results.push(SearchResult {
                chunk_id: hits.ids[i].clone(),
                content: hits.contents[i].clone(),
                file_path: metadata.file_path.clone(),
                start_line: metadata.start_line,
                end_line: metadata.end_line,
                similarity_score: boosted,
                metadata,
            });
        }

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(max_results);

        debug!(query, results = results.len(), "search complete");
        let context_summary = context_summary(query, &results);
        Ok(QueryResponse {
            query: query.to_string(),
            total_results: results.len(),
            results,
            search_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            context_summary,
        })
    }

    /// Assemble a character-budgeted context string from the best hits,
    /// in score order, never exceeding `max_context_length` characters.
    pub fn context_for_completion(
        &self,
        query: &str,
        file_filter: Option<&[String]>,
        max_context_length: Option<usize>,
    ) -> Result<ContextBundle> {
        let budget = max_context_length.unwrap_or(self.config.max_context_length);
        let response = self.search(
            query,
            file_filter,
            Some(self.config.context_search_results),
        )?;

        let mut parts: Vec<String> = Vec::new();
        let mut used_chars = 0usize;

        for result in &response.results {
            let block = format!(
                "\nFile: {} (lines {}-{})\n```\n{}\n```\n",
                result.file_path, result.start_line, result.end_line, result.content
            );
            let block_chars = block.chars().count();
            let separator = if parts.is_empty() { 0 } else { 1 };
            if used_chars + separator + block_chars > budget {
                break;
            }
            used_chars += separator + block_chars;
            parts.push(block);
        }

        let context = parts.join("\n");
        Ok(ContextBundle {
            query: query.to_string(),
            context_length: context.chars().count(),
            context,
            chunks_used: parts.len(),
            total_chunks_found: response.results.len(),
            search_time_ms: response.search_time_ms,
        })
    }

    /// Find code related to `[start_line, end_line]` of one file: search by
    /// the region's own chunks and keep hits that are elsewhere (other files,
    /// or the same file outside the region).
    pub fn explain_code(
        &self,
        file_path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<CodeExplanation> {
        let file_chunks = self.store.chunks_by_file(file_path)?;
        let target: Vec<_> = file_chunks
            .into_iter()
            .filter(|c| c.start_line <= end_line && c.end_line >= start_line)
            .collect();

        if target.is_empty() {
            bail!("No code chunks found for {file_path}:{start_line}-{end_line}");
        }

        let target_code = target
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let response = self.search(&target_code, None, Some(10))?;
        let related_chunks: Vec<SearchResult> = response
            .results
            .into_iter()
            .filter(|r| {
                r.file_path != file_path
                    || !(r.start_line <= end_line && r.end_line >= start_line)
            })
            .take(5)
            .collect();

        Ok(CodeExplanation {
            target_code,
            file_path: file_path.to_string(),
            line_range: format!("{start_line}-{end_line}"),
            related_chunks,
            context_summary: format!(
                "Code explanation context for {file_path}:{start_line}-{end_line}"
            ),
        })
    }

    /// Chunks similar to an existing chunk, excluding the chunk itself.
    pub fn related_chunks(&self, chunk_id: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let Some(chunk) = self
            .store
            .chunk_by_id(chunk_id)
            .context("Failed to look up chunk")?
        else {
            return Ok(Vec::new());
        };

        let response = self.search(&chunk.content, None, Some(max_results + 1))?;
        Ok(response
            .results
            .into_iter()
            .filter(|r| r.chunk_id != chunk_id)
            .take(max_results)
            .collect())
    }
}

fn empty_response(query: &str, started: Instant) -> QueryResponse {
    QueryResponse {
        query: query.to_string(),
        results: Vec::new(),
        total_results: 0,
        search_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        context_summary: format!("No relevant code found for query: '{query}'"),
    }
}

/// Lowercase alphabetic words, minus stop words, longer than two characters.
pub fn extract_keywords(query: &str) -> Vec<String> {
    static WORD: OnceLock<regex::Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| regex::Regex::new(r"\b[a-zA-Z]{2,}\b").expect("static regex"));

    word.find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()) && w.len() > 2)
        .collect()
}

/// Push the base similarity toward 1.0 by keyword evidence.
///
/// Each keyword contributes `min(0.1·count, 0.3)` where `count` is its
/// substring occurrences in the lowercased content; the summed boost is
/// clamped to 0.5 and applied as `base + b·(1 − base)`, capped at 1.0.
/// With no keywords this is the identity.
pub fn apply_keyword_boost(base: f32, content: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return base;
    }

    let content_lower = content.to_lowercase();
    let mut boost = 0.0f32;
    for keyword in keywords {
        let count = content_lower.matches(keyword.as_str()).count();
        if count > 0 {
            boost += (0.1 * count as f32).min(0.3);
        }
    }
    boost = boost.min(0.5);

    (base + boost * (1.0 - base)).min(1.0)
}

fn context_summary(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No relevant code found for query: '{query}'");
    }

    let mut per_file: Vec<(&str, usize)> = Vec::new();
    for result in results {
        match per_file.iter_mut().find(|(f, _)| *f == result.file_path) {
            Some((_, n)) => *n += 1,
            None => per_file.push((&result.file_path, 1)),
        }
    }

    let mut lines = vec![format!(
        "Found {} relevant code chunks for query: '{query}'",
        results.len()
    )];
    if per_file.len() == 1 {
        lines.push(format!("All results from: {}", per_file[0].0));
    } else {
        lines.push(format!("Results from {} files:", per_file.len()));
        for (file, count) in &per_file {
            lines.push(format!("  - {file}: {count} chunks"));
        }
    }
    lines.join("\n")
}
