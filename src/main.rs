//! # Hybrid RAG CLI (`hrag`)
//!
//! ## Usage
//!
//! ```bash
//! hrag --config ./config/hrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hrag init` | Create the SQLite index and run schema migrations |
//! | `hrag sources` | List configured sources |
//! | `hrag ingest` | Ingest every document (or one with `--source-id`) |
//! | `hrag search "<question>"` | Show fused results with per-modality ranks |
//! | `hrag ask "<question>"` | Answer a question with citations |
//! | `hrag serve` | Start the HTTP API |
//!
//! Log verbosity follows `RUST_LOG` (default `hybrid_rag=info`). Logs go to
//! stderr; command output goes to stdout.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hybrid_rag::config::{self, Config};
use hybrid_rag::engine::Engine;
use hybrid_rag::index::SqliteIndex;
use hybrid_rag::ingest::IngestReport;
use hybrid_rag::models::RetrievalMode;
use hybrid_rag::{server, sources};

/// Hybrid RAG: lexical, dense, and sparse retrieval fused with RRF.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hrag",
    about = "Grounded question answering with hybrid retrieval and reciprocal rank fusion",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema. Safe to run repeatedly.
    Init,

    /// List configured document sources.
    Sources,

    /// Ingest documents from every configured source.
    ///
    /// Re-ingesting a document replaces its chunks in place and removes
    /// chunks that no longer exist.
    Ingest {
        /// Only ingest the document with this source id.
        #[arg(long)]
        source_id: Option<String>,
    },

    /// Retrieve and fuse results without calling the generator.
    Search {
        question: String,

        /// `hybrid`, `lexical_only`, `dense_only`, or `sparse_only`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of fused results to print.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question from the indexed documents.
    Ask {
        question: String,

        #[arg(long)]
        mode: Option<String>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn parse_mode(raw: Option<&str>, cfg: &Config) -> anyhow::Result<RetrievalMode> {
    match raw {
        Some(raw) => raw.parse().map_err(anyhow::Error::msg),
        None => Ok(cfg.retrieval.default_mode),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hybrid_rag=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let index = SqliteIndex::open(&cfg.index.path)
                .await
                .with_context(|| format!("Failed to open index at {}", cfg.index.path.display()))?;
            index.close().await;
            println!("Index initialized at {}", cfg.index.path.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Ingest { source_id } => {
            let engine = Engine::from_config(&cfg).await?;
            let report = match source_id {
                Some(id) => {
                    let doc = engine.ingest_document(&id).await?;
                    IngestReport {
                        documents: vec![doc],
                        failures: Vec::new(),
                    }
                }
                None => engine.ingest_all().await,
            };
            report.print();
            if report.documents.is_empty() && !report.failures.is_empty() {
                bail!("No documents were ingested");
            }
        }
        Commands::Search {
            question,
            mode,
            limit,
        } => {
            let mode = parse_mode(mode.as_deref(), &cfg)?;
            let engine = Engine::from_config(&cfg).await?;
            let retrieved = engine.answer(&question, mode).await?;

            if retrieved.results.is_empty() {
                println!("No results.");
            }
            let limit = limit.unwrap_or(retrieved.results.len());
            for (i, r) in retrieved.results.iter().take(limit).enumerate() {
                let ranks: Vec<String> = r
                    .modality_ranks
                    .iter()
                    .map(|(m, rank)| format!("{}={}", m, rank))
                    .collect();
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    r.fused_score,
                    r.chunk.source_filename,
                    ranks.join(", ")
                );
                println!("    chunk: {}  hash: {}", r.chunk.chunk_id, &r.chunk.hash[..12.min(r.chunk.hash.len())]);
                let preview: String = r.chunk.text.chars().take(cfg.context.snippet_chars).collect();
                println!("    {}", preview.replace('\n', " "));
            }
            if retrieved.degraded() {
                for failure in &retrieved.failures {
                    println!("degraded: {}", failure);
                }
            }
        }
        Commands::Ask { question, mode } => {
            let mode = parse_mode(mode.as_deref(), &cfg)?;
            let engine = Engine::from_config(&cfg).await?;
            let answer = engine.ask(&question, mode).await?;

            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for c in &answer.citations {
                    match &c.source_url {
                        Some(url) => println!("  - {} ({}) {}", c.source_filename, c.chunk_id, url),
                        None => println!("  - {} ({})", c.source_filename, c.chunk_id),
                    }
                }
            }
            if answer.degraded {
                let failed: Vec<&str> = answer.failed_modalities.iter().map(|m| m.as_str()).collect();
                println!();
                println!("(degraded: {} unavailable)", failed.join(", "));
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
