use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard safety ceiling: files larger than this are **always** skipped, regardless of config.
/// Oversized files are usually generated bundles or data dumps, not source.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1024 * 1024; // 1 MiB

/// Controls the token chunker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Window length in cl100k_base tokens.
    pub chunk_size: usize,
    /// Tokens shared between consecutive windows.
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Controls tree scanning behavior (what to skip).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-file size cap in bytes. Clamped to [`ABSOLUTE_MAX_FILE_BYTES`].
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: ABSOLUTE_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// HuggingFace model repo ID used by Model2Vec-RS.
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "minishlab/potion-retrieval-32M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Default number of results returned by `search`.
    pub max_results: usize,
    /// Hits with a boosted similarity below this are dropped.
    pub similarity_threshold: f32,
    /// Character budget for assembled completion context.
    pub max_context_length: usize,
    /// How many results `context_for_completion` fetches before budgeting.
    pub context_search_results: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 10,
            similarity_threshold: 0.0,
            max_context_length: 16_000,
            context_search_results: 50,
        }
    }
}

/// What to do when the cache was built for a different root path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootChangeAction {
    /// Ask the user (CLI flow); non-interactive callers treat this as refuse.
    Prompt,
    /// Wipe both stores and reindex from scratch.
    Clear,
    /// Abort the sync and keep the existing cache untouched.
    Refuse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `cache.db` and the vector collection, relative to the root.
    pub cache_dir: PathBuf,
    pub chunker: ChunkerConfig,
    pub scan: ScanConfig,
    pub embedding: EmbeddingConfig,
    pub query: QueryConfig,
    pub on_root_change: RootChangeAction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".minipilot"),
            chunker: ChunkerConfig::default(),
            scan: ScanConfig::default(),
            embedding: EmbeddingConfig::default(),
            query: QueryConfig::default(),
            on_root_change: RootChangeAction::Prompt,
        }
    }
}

impl Config {
    /// Effective per-file size cap after applying the hard ceiling.
    pub fn max_file_bytes(&self) -> u64 {
        self.scan.max_file_bytes.min(ABSOLUTE_MAX_FILE_BYTES)
    }

    /// Resolve the cache directory against `root` when it is relative.
    pub fn cache_dir_under(&self, root: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            root.join(&self.cache_dir)
        }
    }
}

pub fn load_config(repo_root: &Path) -> Config {
    let primary = repo_root.join(".minipilot.json");

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}
