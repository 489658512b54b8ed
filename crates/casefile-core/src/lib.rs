//! # Casefile Core
//!
//! Shared logic for Casefile: data models, the page-aware chunker,
//! BM25 and reciprocal-rank-fusion retrieval, citation parsing, and the
//! [`Store`](store::Store) and [`Embedder`](embedding::Embedder) traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP clients.
//! The `casefile` application crate supplies concrete stores, providers,
//! and the agent loop.

pub mod bm25;
pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{Error, Result};
