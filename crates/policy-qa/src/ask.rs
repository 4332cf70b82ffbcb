//! Query-side commands: `ask retrieve`, `ask query`, and `ask chat`.
//!
//! Each command opens the index database, loads the stored snapshot into
//! a [`VectorIndex`], and runs the pipeline against it. Answers go to
//! stdout; diagnostics go through `tracing` to stderr.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader};

use policy_qa_core::index::VectorIndex;
use policy_qa_core::models::{AnswerResult, AnswerStatus, ConversationTurn, RetrievedPassage};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::llm::create_language_model;
use crate::migrate::run_migrations;
use crate::pipeline::{QueryRequest, RagPipeline};
use crate::store;

/// Open (and migrate) the index database.
pub async fn open_pool(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(&config.index.path).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Build a pipeline with the configured embedder and language model over
/// `index`.
pub fn build_pipeline(config: &Config, index: VectorIndex) -> Result<RagPipeline> {
    let embedder = create_embedder(&config.embedding)?;
    let llm = create_language_model(&config.llm)?;
    RagPipeline::new(config, embedder, llm, Arc::new(index))
}

/// Build a pipeline over the stored index (empty if nothing was ingested).
///
/// The stored index must have been built with the configured embedding
/// model and dimensionality; otherwise this fails with
/// [`IndexError::Corrupt`](policy_qa_core::error::IndexError::Corrupt) and
/// `ask ingest` rebuilds it.
pub async fn open_pipeline(config: &Config) -> Result<(RagPipeline, SqlitePool)> {
    let pool = open_pool(config).await?;
    let embedder = create_embedder(&config.embedding)?;
    let index = match store::load_snapshot(&pool, embedder.model_name(), embedder.dims()).await? {
        Some(snapshot) => VectorIndex::from_snapshot(snapshot),
        None => VectorIndex::new(),
    };
    let llm = create_language_model(&config.llm)?;
    let pipeline = RagPipeline::new(config, embedder, llm, Arc::new(index))?;
    Ok((pipeline, pool))
}

async fn open_populated(config: &Config) -> Result<RagPipeline> {
    let (pipeline, pool) = open_pipeline(config).await?;
    pool.close().await;
    if pipeline.index().is_empty() {
        bail!(
            "The index at {} is empty. Run `ask ingest` first.",
            config.index.path.display()
        );
    }
    Ok(pipeline)
}

pub async fn run_retrieve(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    threshold: Option<f32>,
) -> Result<()> {
    let pipeline = open_populated(config).await?;
    let passages = pipeline
        .retrieve(
            query,
            top_k.unwrap_or(config.retrieval.top_k),
            threshold.unwrap_or(config.retrieval.similarity_threshold),
        )
        .await?;

    if passages.is_empty() {
        println!("No passages above the similarity threshold.");
        return Ok(());
    }
    for (i, passage) in passages.iter().enumerate() {
        print_passage(i + 1, passage);
    }
    Ok(())
}

fn print_passage(rank: usize, passage: &RetrievedPassage) {
    println!(
        "{}. [{:.3}] {}",
        rank,
        passage.similarity_score,
        passage.label()
    );
    println!("    chunk: {}", passage.chunk_id);
    let preview: String = passage.text.chars().take(240).collect();
    let ellipsis = if passage.text.chars().count() > 240 {
        "…"
    } else {
        ""
    };
    println!("    {}{}", preview.replace('\n', " "), ellipsis);
    println!();
}

pub async fn run_query(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    threshold: Option<f32>,
    json: bool,
) -> Result<()> {
    let pipeline = open_populated(config).await?;
    let request = QueryRequest {
        top_k,
        similarity_threshold: threshold,
        ..QueryRequest::new(query)
    };
    let result = pipeline.query(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_answer(&result);
    }
    Ok(())
}

fn print_answer(result: &AnswerResult) {
    println!("{}", result.text);
    print_footer(result);
}

fn print_footer(result: &AnswerResult) {
    if !result.citations.is_empty() {
        println!();
        println!("Sources:");
        for source in &result.citations {
            println!("  - {}", source);
        }
    }
    if result.status == AnswerStatus::Answered && !result.grounded {
        println!();
        println!("(not grounded in the retrieved passages)");
    }
}

/// Interactive session on stdin. Answers are streamed as they are
/// generated. The session owns the history and keeps at most
/// `conversation.max_history` turns of it.
pub async fn run_chat(config: &Config) -> Result<()> {
    let pipeline = open_populated(config).await?;
    let max_history = config.conversation.max_history;
    let mut history: Vec<ConversationTurn> = Vec::new();

    println!("Ask about the policies. Type `exit` to quit, `clear` to reset the conversation.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                history.clear();
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        let request = QueryRequest::new(line).with_history(history.clone());
        let mut streamed = false;
        let outcome = pipeline
            .query_streaming(&request, &mut |delta: &str| {
                streamed = true;
                print!("{}", delta);
                let _ = std::io::stdout().flush();
            })
            .await;
        match outcome {
            Ok(result) => {
                if streamed && result.status == AnswerStatus::Answered {
                    println!();
                    print_footer(&result);
                } else {
                    if streamed {
                        println!();
                    }
                    print_answer(&result);
                }
                history.push(ConversationTurn::user(line));
                history.push(ConversationTurn::assistant(result.text));
                if history.len() > max_history {
                    let excess = history.len() - max_history;
                    history.drain(..excess);
                }
            }
            Err(e) => println!("Error: {}", e),
        }
        println!();
    }
    Ok(())
}
