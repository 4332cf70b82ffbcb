//! # Policy QA Core
//!
//! Runtime-free logic for the Policy QA pipeline: data models, error
//! taxonomy, chunking, the embedding trait, the in-memory vector index,
//! retrieval, and grounded prompt assembly.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O.
//! Collaborators that talk to the outside world (document loaders,
//! embedding providers, the language-model client) live in the
//! `policy-qa` app crate and plug in through the traits defined here.
//!
//! ```text
//!  Document ──► chunk ──► EmbeddingModel ──► VectorIndex
//!                                               │
//!  query ──► EmbeddingModel ──► Retriever ◄─────┘
//!                                  │
//!                                  ▼
//!                     prompt::build_prompt ──► LanguageModel
//! ```

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod text;
