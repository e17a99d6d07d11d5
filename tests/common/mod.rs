use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use minipilot::config::Config;
use minipilot::embedder::Embedder;
use minipilot::indexer::Indexer;
use minipilot::query::QueryEngine;

/// Deterministic bag-of-tokens embedder for tests.
///
/// Each distinct token gets its own dimension (assigned on first sight from
/// a shared registry), so texts with no tokens in common are orthogonal and
/// shared vocabulary produces real cosine overlap. Instructions are ignored
/// so queries and documents live in the same space. Share one instance
/// between the indexer and the query engine: the registry is per-instance.
pub struct StubEmbedder {
    model_id: String,
    dimension: usize,
    registry: Mutex<HashMap<String, usize>>,
}

impl StubEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension: 256,
            registry: Mutex::new(HashMap::new()),
        }
    }
}

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str, _instruction: Option<&str>) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut registry = self.registry.lock().unwrap();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let next = registry.len();
            let slot = *registry.entry(token.to_string()).or_insert(next) % self.dimension;
            vector[slot] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

pub fn stub_embedder() -> Arc<StubEmbedder> {
    Arc::new(StubEmbedder::new("stub-bag-of-tokens"))
}

/// Default config with a small positive similarity threshold so orthogonal
/// (zero-similarity) hits do not pad results.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.query.similarity_threshold = 0.05;
    cfg
}

pub fn open_indexer(root: &Path, embedder: Arc<StubEmbedder>) -> Indexer {
    Indexer::open(root, test_config(), embedder).expect("open indexer")
}

pub fn open_engine(root: &Path, embedder: Arc<StubEmbedder>) -> QueryEngine {
    QueryEngine::open(root, &test_config(), embedder).expect("open query engine")
}

/// Write a set of (relative path, content) files under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}
