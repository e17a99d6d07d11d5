use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Process-wide cl100k_base instance (lazy, thread-safe). Loading the BPE
/// ranks takes tens of milliseconds; doing it once matters for tests that
/// construct many chunkers.
static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

fn tokenizer() -> &'static CoreBPE {
    TOKENIZER.get_or_init(|| cl100k_base().expect("Failed to load cl100k_base tokenizer"))
}

/// SHA-256 hex digest of a string's UTF-8 bytes.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A contiguous token window of one file, ready for storage and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `"<path>:<chunk_index>:<start_line>-<end_line>"` — stable across runs
    /// for unchanged content and chunker parameters.
    pub id: String,
    pub file_path: String,
    pub content: String,
    /// SHA-256 hex of the chunk text.
    pub hash: String,
    /// Newlines in the decoded token stream before this chunk.
    pub start_line: u32,
    /// `start_line` plus the newlines inside this chunk.
    pub end_line: u32,
    /// 0-based position within the file.
    pub chunk_index: u32,
    pub token_count: usize,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    /// `chunk_overlap` is clamped below `chunk_size` so the window always
    /// advances.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Slide a `chunk_size` window over the encoded stream, advancing by
    /// `chunk_size − chunk_overlap`. The final chunk ends at the stream end
    /// and may be shorter. Empty input produces no chunks.
    pub fn chunk_text(&self, text: &str, file_path: &str) -> Vec<Chunk> {
        let bpe = tokenizer();
        let tokens = bpe.encode_ordinary(text);
        let mut chunks = Vec::new();

        let mut start = 0usize;
        let mut chunk_index = 0u32;

        while start < tokens.len() {
            let end = (start + self.chunk_size).min(tokens.len());
            let content = decode_lossy(bpe, &tokens[start..end]);

            let lines_before = if start > 0 {
                count_newlines(&decode_lossy(bpe, &tokens[..start]))
            } else {
                0
            };
            let lines_in_chunk = count_newlines(&content);

            let start_line = lines_before;
            let end_line = lines_before + lines_in_chunk;

            chunks.push(Chunk {
                id: format!("{file_path}:{chunk_index}:{start_line}-{end_line}"),
                file_path: file_path.to_string(),
                hash: sha256_hex(&content),
                content,
                start_line,
                end_line,
                chunk_index,
                token_count: end - start,
            });
            chunk_index += 1;

            if end >= tokens.len() {
                break;
            }
            start = end - self.chunk_overlap;
        }

        chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

/// Read a file strictly as UTF-8. Decode errors, permission errors and
/// missing files all yield `None`; the caller skips the file.
pub fn load_file_content(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn count_newlines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

/// Decode a token slice. A window boundary can land inside a multi-byte
/// character; when the whole slice fails UTF-8 validation, decode token by
/// token and drop the unrepresentable fragments.
fn decode_lossy(bpe: &CoreBPE, tokens: &[usize]) -> String {
    match bpe.decode(tokens.to_vec()) {
        Ok(text) => text,
        Err(_) => tokens
            .iter()
            .map(|&t| bpe.decode(vec![t]).unwrap_or_default())
            .collect(),
    }
}
