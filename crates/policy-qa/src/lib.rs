//! # Policy QA
//!
//! Grounded question answering over a policy manual and scraped policy
//! pages. Sources are loaded, chunked, embedded, and indexed once; each
//! question is answered strictly from the passages that clear a similarity
//! threshold, with citations, or refused when nothing does.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Loader    │──▶│ Chunk+Embed  │──▶│ VectorIndex │──▶│  SQLite  │
//! │  PDF / Web  │   │              │   │ (snapshots) │   │ (store)  │
//! └─────────────┘   └──────────────┘   └──────┬──────┘   └──────────┘
//!                                             │
//!              query ──▶ Retriever ◀──────────┘
//!                            │
//!                            ▼
//!                    AnswerComposer ──▶ chat-completions LLM
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ask init                                  # write config/ask.toml, create the index db
//! ask ingest                                # load, chunk, embed, store
//! ask query "What is the late fee?"
//! ask chat
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`loader`] | PDF and web document loading |
//! | [`html`] | Main-content extraction from HTML |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | OpenAI-compatible chat-completions client |
//! | [`answer`] | Grounded answer composition with retries |
//! | [`pipeline`] | Refresh / retrieve / answer / query façade |
//! | [`store`] | SQLite persistence of the index |
//! | [`progress`] | Ingest progress reporting |
//! | [`ingest`] / [`ask`] / [`stats`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! The pure pipeline logic (models, chunking, index, retrieval, prompts)
//! lives in the `policy-qa-core` crate.

pub mod answer;
pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod html;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod store;
