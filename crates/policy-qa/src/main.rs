//! # Policy QA CLI (`ask`)
//!
//! Builds the policy index and answers questions against it.
//!
//! ## Usage
//!
//! ```bash
//! ask --config ./config/ask.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ask init` | Write a starter config (if missing) and create the index database |
//! | `ask ingest` | Load, chunk, and embed all sources; replace the stored index |
//! | `ask retrieve "<q>"` | Show the passages a question would be answered from |
//! | `ask query "<q>"` | Answer one question with citations |
//! | `ask chat` | Interactive session with conversation history |
//! | `ask stats` | Summary of the stored index |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest the manual and one extra page, skipping the default scrape target
//! ask ingest --pdf reference/manual.pdf --url https://example.edu/fees --no-scrape
//!
//! # Machine-readable answer
//! ask query "What is the late fee?" --json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use policy_qa::config::{self, Config};
use policy_qa::ingest::IngestOptions;
use policy_qa::progress::ProgressMode;
use policy_qa::{ask, db, ingest, logging, migrate, stats};

/// Policy QA: grounded answers from the policy manual and policy pages.
#[derive(Parser)]
#[command(name = "ask", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ask.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config if none exists and create the index database.
    ///
    /// Idempotent: an existing config file is never overwritten.
    Init,

    /// Rebuild the index from the configured sources.
    ///
    /// Sources that fail to load and chunks that fail to embed are skipped
    /// and listed at the end. The stored index is replaced only when at
    /// least one chunk was embedded.
    Ingest {
        /// Additional PDF file (repeatable).
        #[arg(long = "pdf")]
        pdfs: Vec<String>,

        /// Additional web page (repeatable).
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Skip the configured scrape target.
        #[arg(long)]
        no_scrape: bool,

        /// Progress output on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show the passages retrieved for a question, without calling the LLM.
    Retrieve {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Answer one question.
    Query {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        threshold: Option<f32>,

        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Interactive question answering on stdin.
    Chat,

    /// Summarize the stored index.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        if config::write_template(&cli.config)? {
            println!("Wrote {}", cli.config.display());
        }
    }

    let cfg: Config = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.index.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Index database initialized at {}.", cfg.index.path.display());
        }
        Commands::Ingest {
            pdfs,
            urls,
            no_scrape,
            progress,
        } => {
            let options = IngestOptions {
                extra_pdfs: pdfs,
                extra_urls: urls,
                no_scrape,
            };
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_ingest(&cfg, &options, mode).await?;
        }
        Commands::Retrieve {
            query,
            top_k,
            threshold,
        } => {
            ask::run_retrieve(&cfg, &query, top_k, threshold).await?;
        }
        Commands::Query {
            query,
            top_k,
            threshold,
            json,
        } => {
            ask::run_query(&cfg, &query, top_k, threshold, json).await?;
        }
        Commands::Chat => {
            ask::run_chat(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
