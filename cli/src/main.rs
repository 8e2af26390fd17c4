//! `vembed`: generate embeddings and query the vector index from the shell.
//!
//! Every command prints its result as JSON on stdout; logs go to stderr and
//! are filtered with `RUST_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use vembed_engine::{
    DEFAULT_CLUSTERS, DEFAULT_PAIR_THRESHOLD, DEFAULT_TOP_K, EngineConfig, Metadata, VectorEngine,
};

#[derive(Parser)]
#[command(name = "vembed")]
#[command(about = "Embed texts, index them, and search by meaning")]
struct Cli {
    /// TOML configuration file. Environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Index file, overriding the configured path.
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a single text
    Generate {
        text: String,
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Embed several texts in one request
    Batch {
        texts: Vec<String>,
        /// Read additional texts from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Find indexed texts similar to a query
    Search {
        query: String,
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Drop results scoring below this
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Embed texts and add them to the index
    Add {
        texts: Vec<String>,
        /// Read additional texts from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// JSON array of metadata objects, one per text
        #[arg(long)]
        metadata: Option<String>,
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Group indexed texts with k-means
    Cluster {
        #[arg(short = 'n', long, default_value_t = DEFAULT_CLUSTERS)]
        clusters: usize,
    },

    /// List pairs of indexed texts at least this similar
    SimilarPairs {
        #[arg(short, long, default_value_t = DEFAULT_PAIR_THRESHOLD)]
        threshold: f32,
    },

    /// Show index statistics
    Stats,

    /// List available models
    Models,

    /// Report provider, cache and index status
    Health,

    /// Remove every vector from the index
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(index) = cli.index {
        config = config.with_index_path(index);
    }
    let engine = VectorEngine::new(config).await?;

    run(&engine, cli.command).await
}

async fn run(engine: &VectorEngine, command: Command) -> Result<()> {
    match command {
        Command::Generate { text, model } => {
            print_json(&engine.generate(&text, model.as_deref()).await?)
        }
        Command::Batch { texts, file, model } => {
            let texts = collect_texts(texts, file.as_deref())?;
            print_json(&engine.generate_batch(&texts, model.as_deref()).await?)
        }
        Command::Search {
            query,
            top_k,
            threshold,
            model,
        } => print_json(
            &engine
                .search(&query, top_k, threshold, model.as_deref())
                .await?,
        ),
        Command::Add {
            texts,
            file,
            metadata,
            model,
        } => {
            let texts = collect_texts(texts, file.as_deref())?;
            let metadata = metadata.as_deref().map(parse_metadata).transpose()?;
            let output = engine.add_vectors(texts, metadata, model.as_deref()).await?;
            engine.save().await?;
            print_json(&output)
        }
        Command::Cluster { clusters } => print_json(&engine.cluster(clusters).await?),
        Command::SimilarPairs { threshold } => {
            print_json(&engine.similar_pairs(threshold).await?)
        }
        Command::Stats => print_json(&engine.stats().await),
        Command::Models => print_json(&engine.list_models()),
        Command::Health => print_json(&engine.health().await),
        Command::Clear => {
            engine.clear().await;
            engine.save().await?;
            print_json(&serde_json::json!({ "message": "Vector index cleared" }))
        }
    }
}

fn collect_texts(mut texts: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(file) = file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        texts.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    if texts.is_empty() {
        bail!("no texts given");
    }
    Ok(texts)
}

fn parse_metadata(raw: &str) -> Result<Vec<Metadata>> {
    serde_json::from_str(raw).context("metadata must be a JSON array of objects")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
