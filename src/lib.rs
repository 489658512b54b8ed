//! # Casefile
//!
//! Question answering with citations over legal PDFs.
//!
//! Lawyers upload leases, contracts, and title documents into a
//! conversation. Each document gets a stable label (`Doc A`, `Doc B`, …),
//! is split into page-aware chunks, enriched with situating context, and
//! embedded. Questions are answered by a tool-calling agent that searches
//! the documents with hybrid (vector + BM25) retrieval and cites its
//! sources by label, page, and section.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Extract  │──▶│  Chunk +  │──▶│  Embed   │──▶│  SQLite  │
//! │ PDF/OCR  │   │  Enrich   │   │          │   │          │
//! └──────────┘   └───────────┘   └──────────┘   └────┬─────┘
//!                                                    │
//!                      ┌─────────────────────────────┤
//!                      ▼                             ▼
//!                ┌───────────┐   search tool   ┌───────────┐
//!                │   Agent   │◀───────────────▶│ Retriever │
//!                └─────┬─────┘                 └───────────┘
//!                      ▼
//!              CLI (casefile) / HTTP (SSE)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`extract`] | PDF validation, text layer, OCR |
//! | [`enrich`] | Per-chunk context and section labelling |
//! | [`ingest`] | Upload pipeline |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Chat model client and stream parsing |
//! | [`tools`] | Tools the agent can call |
//! | [`agent`] | Question-answering loop |
//! | [`sqlite_store`] | SQLite-backed store |
//! | [`server`] | HTTP server |
//! | [`app`] | Wiring of store, providers, and pipelines |
//! | [`commands`] | CLI subcommand implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! Retrieval, chunking, and citation parsing live in `casefile-core`.

pub mod agent;
pub mod app;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
pub mod tools;
