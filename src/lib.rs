//! # Hybrid RAG
//!
//! Grounded question answering over a private document corpus.
//!
//! Every chunk is indexed three ways: as full text (BM25), as a dense
//! embedding, and as a sparse term-expansion vector. A question fans out to
//! all three legs in parallel, the ranked lists are merged with Reciprocal
//! Rank Fusion, and the top results are packed into a context block with
//! one citation per included chunk.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌────────────┐
//! │ Sources     │──▶│ Extract + Chunk      │──▶│ SQLite     │
//! │ FS / Drive  │   │ Dense + Sparse reps  │   │ FTS5 + Vec │
//! └─────────────┘   └──────────────────────┘   └─────┬──────┘
//!                                                    │
//!                 ┌──────────────────────────────────┤
//!                 ▼                                  ▼
//!          ┌────────────┐   ┌──────┐   ┌─────────┐   ┌────────────┐
//!          │ Fan-out    │──▶│ RRF  │──▶│ Context │──▶│ Generator  │
//!          │ lex/dense/ │   │      │   │ + cites │   │ (Ollama)   │
//!          │ sparse     │   └──────┘   └─────────┘   └────────────┘
//!          └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hrag init                          # create the index
//! hrag ingest                        # index every configured source
//! hrag search "pump pressure"        # fused results with per-leg ranks
//! hrag ask "What is the max pressure?"
//! hrag serve                         # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`sources`] | Document source abstraction |
//! | [`connector_fs`] | Filesystem source |
//! | [`connector_drive`] | Google Drive source |
//! | [`extract`] | PDF and text extraction |
//! | [`chunk`] | Boundary-aware chunking |
//! | [`embedding`] | Dense embedding providers |
//! | [`sparse`] | Sparse term-expansion encoders |
//! | [`represent`] | All-or-nothing chunk representation |
//! | [`index`] | Search index trait, SQLite and in-memory backends |
//! | [`ingest`] | Ingestion pipeline and index writer |
//! | [`retrieve`] | Per-modality retrievers and fan-out |
//! | [`fusion`] | Reciprocal Rank Fusion |
//! | [`context`] | Context and citation assembly |
//! | [`generate`] | Answer generation |
//! | [`engine`] | End-to-end ingestion and question answering |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod connector_drive;
pub mod connector_fs;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fusion;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod represent;
pub mod retrieve;
pub mod server;
pub mod sources;
pub mod sparse;
