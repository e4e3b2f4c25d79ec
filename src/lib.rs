//! # Research Harness
//!
//! A research orchestration engine with retrieval-augmented context.
//!
//! A research question is decomposed into sub-queries, each handled by a
//! search subagent that pulls web results through a provider gateway and
//! repository context through a hybrid retriever. The findings are merged
//! into a cited report.
//!
//! ## Architecture
//!
//! ```text
//!  start_task ──▶ TaskCoordinator ──▶ SearchSubagent × N ──▶ SynthesisStage
//!                      │                 │          │              │
//!                      │                 ▼          ▼              ▼
//!                      │          ProviderGateway  ContextRetriever  Report
//!                      │          (model, search)  (vector + code)
//!                      ▼
//!                 HybridStore (cache + SQLite)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rh init                                  # create database
//! rh index my-repo ./path/to/repo          # chunk and index a repository
//! rh context "session tokens" --repo my-repo
//! rh research "compare X and Y" --repo my-repo
//! rh serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`hybrid_store`] | TTL cache over a durable key/value store |
//! | [`providers`] | Model/search adapters and the fallback gateway |
//! | [`retriever`] | Hybrid documentation + code retrieval |
//! | [`subagent`] | One sub-query, end to end |
//! | [`coordinator`] | Task lifecycle, fan-out, cancellation |
//! | [`synthesis`] | Report drafting and citation |
//! | [`engine`] | Facade used by the CLI and HTTP server |
//! | [`ingest`] | Directory indexing |
//! | [`server`] | HTTP API |
//! | [`db`] / [`migrate`] / [`sqlite_store`] | SQLite persistence |

pub mod config;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod hybrid_store;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod providers;
pub mod retriever;
pub mod server;
pub mod sqlite_store;
pub mod subagent;
pub mod synthesis;

pub use engine::{EngineBuilder, ResearchEngine};
pub use error::{ProviderError, ResearchError};
