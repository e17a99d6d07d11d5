use anyhow::{Context, Result};
use model2vec_rs::model::StaticModel;

/// Instruction strings for instruction-conditioned retrieval encoders.
/// These are part of the on-disk contract: changing one changes every
/// affected embedding, so treat them as frozen.
pub const DOCS_INSTRUCTION: &str =
    "Represent the project documentation and content for semantic retrieval:";
pub const COMPONENT_INSTRUCTION: &str =
    "Represent the website content and component for semantic search:";
pub const CONFIG_INSTRUCTION: &str = "Represent the configuration data for semantic search:";
pub const CODE_INSTRUCTION: &str =
    "Represent the code snippet for semantic search and retrieval:";
pub const QUERY_INSTRUCTION: &str =
    "Represent the user question for retrieving relevant website content and code snippets:";

/// Pick the indexing instruction from the file extension.
pub fn instruction_for_path(rel_path: &str) -> &'static str {
    let lower = rel_path.to_ascii_lowercase();
    if lower.ends_with(".md") {
        DOCS_INSTRUCTION
    } else if lower.ends_with(".astro") || lower.ends_with(".vue") || lower.ends_with(".svelte") {
        COMPONENT_INSTRUCTION
    } else if lower.ends_with(".json") || lower.ends_with(".yaml") || lower.ends_with(".yml") {
        CONFIG_INSTRUCTION
    } else {
        CODE_INSTRUCTION
    }
}

/// Opaque text→vector mapping with a fixed dimension per model.
///
/// Implementations must be deterministic for a given (text, instruction)
/// pair; chunk embeddings are cached across runs keyed only by chunk id.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str, instruction: Option<&str>) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String], instruction: Option<&str>) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t, instruction)).collect()
    }

    fn dimension(&self) -> usize;

    fn model_id(&self) -> &str;
}

/// Production embedder backed by a Model2Vec static model. The instruction
/// is prepended to the encoded text, matching how retrieval-tuned static
/// models expect their prompts.
pub struct Model2VecEmbedder {
    model: StaticModel,
    model_id: String,
    dimension: usize,
}

impl Model2VecEmbedder {
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .with_context(|| format!("Failed to load embedding model {model_id}"))?;
        // Probe the output width once; every later call must match it.
        let dimension = model.encode_single("dimension probe").len();
        Ok(Self {
            model,
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

impl Embedder for Model2VecEmbedder {
    fn embed(&self, text: &str, instruction: Option<&str>) -> Result<Vec<f32>> {
        let conditioned = match instruction {
            Some(prefix) => format!("{prefix}\n{text}"),
            None => text.to_string(),
        };
        Ok(self.model.encode_single(&conditioned))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
