use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use minipilot::config::{load_config, Config, RootChangeAction};
use minipilot::embedder::{Embedder, Model2VecEmbedder};
use minipilot::indexer::{status_report, Indexer};
use minipilot::query::QueryEngine;
use minipilot::store::MetadataStore;
use minipilot::vector_store::VectorStore;

#[derive(Debug, Parser)]
#[command(name = "minipilot")]
#[command(version)]
#[command(about = "Incremental semantic indexing and retrieval over a source tree")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the index, or refresh it from the last sync
    Index {
        /// Reprocess only files whose content changed since the last sync.
        #[arg(long)]
        incremental: bool,

        /// Clear the existing cache without prompting when the indexed root
        /// differs from the current one.
        #[arg(long)]
        force_clear: bool,
    },
    /// Semantic search over indexed chunks
    Search {
        query: String,

        /// Restrict results to these relative paths.
        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,

        /// Max number of results.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Assemble completion context under a character budget
    Context {
        query: String,

        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,

        /// Character budget override.
        #[arg(long)]
        max_length: Option<usize>,
    },
    /// Retrieve code related to a line range of one file
    Explain {
        path: String,
        start: u32,
        end: u32,
    },
    /// Index statistics
    Status,
}

fn spinner(msg: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar.set_message(msg.to_string());
    bar
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [Y/n]: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer != "n" && answer != "no")
}

fn load_embedder(model_id: &str) -> Result<Arc<dyn Embedder>> {
    let bar = spinner("loading embedding model...");
    let embedder = Model2VecEmbedder::load(model_id)?;
    bar.finish_with_message(format!("model ready: {model_id}"));
    Ok(Arc::new(embedder))
}

/// For read-side commands the model recorded on stored embeddings wins,
/// so queries always run in the same vector space the index was built in.
fn query_engine(root: &std::path::Path, cfg: &Config) -> Result<QueryEngine> {
    let cache_dir = cfg.cache_dir_under(root);
    let store = MetadataStore::open(&cache_dir.join("cache.db"))?;
    let model_id = store
        .embedding_model()?
        .unwrap_or_else(|| cfg.embedding.model.clone());
    let embedder = load_embedder(&model_id)?;
    let vectors = VectorStore::open(&cache_dir.join("vectors"))?;
    Ok(QueryEngine::new(store, vectors, embedder, cfg.query.clone()))
}

fn run_index(root: &std::path::Path, cfg: Config, incremental: bool, force_clear: bool) -> Result<()> {
    let embedder = load_embedder(&cfg.embedding.model)?;
    let prompt_on_change = cfg.on_root_change == RootChangeAction::Prompt;
    let mut indexer = Indexer::open(root, cfg, embedder)?;

    if let Some(prior) = indexer.root_change()? {
        let clear = force_clear
            || (prompt_on_change
                && confirm(&format!(
                    "Index was built for {}; clear it and reindex {}?",
                    prior.display(),
                    indexer.root().display()
                ))?);
        if clear {
            indexer.clear_all_state()?;
        } else if prompt_on_change {
            bail!("keeping the existing cache; rerun with --force-clear to replace it");
        }
        // Refuse/Clear configs are handled inside the sync itself.
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} files")
            .unwrap()
            .progress_chars("█▓░"),
    );

    let report = if incremental {
        let report = indexer.incremental_sync_with_progress(|done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })?;
        serde_json::to_string_pretty(&report)?
    } else {
        let report = indexer.full_index_with_progress(|done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })?;
        serde_json::to_string_pretty(&report)?
    };
    bar.finish_and_clear();

    println!("{report}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(r) => r,
        None => std::env::current_dir().context("Failed to get current dir")?,
    };
    let cfg = load_config(&root);

    match cli.cmd {
        Command::Index {
            incremental,
            force_clear,
        } => run_index(&root, cfg, incremental, force_clear)?,

        Command::Search { query, files, limit } => {
            let engine = query_engine(&root, &cfg)?;
            let response = engine.search(&query, files.as_deref(), limit)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Context {
            query,
            files,
            max_length,
        } => {
            let engine = query_engine(&root, &cfg)?;
            let bundle = engine.context_for_completion(&query, files.as_deref(), max_length)?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }

        Command::Explain { path, start, end } => {
            let engine = query_engine(&root, &cfg)?;
            let explanation = engine.explain_code(&path, start, end)?;
            println!("{}", serde_json::to_string_pretty(&explanation)?);
        }

        Command::Status => {
            let root = std::fs::canonicalize(&root).unwrap_or(root);
            let cache_dir = cfg.cache_dir_under(&root);
            let store = MetadataStore::open(&cache_dir.join("cache.db"))?;
            let vectors = VectorStore::open(&cache_dir.join("vectors"))?;
            let report = status_report(&root, &cache_dir, &store, &vectors)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
