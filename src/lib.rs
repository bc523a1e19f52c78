//! chronicler - context retrieval for a historical-figure chatbot
//!
//! This crate provides:
//! - A context store of per-figure text chunks (SQLite)
//! - Pluggable embedding backends (local fastembed model or OpenAI API)
//! - A filterable vector index (embedded SQLite, Qdrant, or in-memory)
//! - An idempotent ingestion pipeline from store to index
//! - Figure-scoped retrieval and a persona chat orchestrator on top of it

pub mod chat;
pub mod commands;
pub mod config;
pub mod db;
pub mod embed;
pub mod error;
pub mod ingest;
pub mod meta;
pub mod progress;
pub mod retrieve;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
