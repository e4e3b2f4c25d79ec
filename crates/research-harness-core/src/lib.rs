//! # Research Harness Core
//!
//! Runtime-free logic for Research Harness: data models, the research task
//! stage machine, chunking, index and durable-store abstractions, and the
//! deterministic context ranking algorithm.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! application crate wires these pieces to real backends.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
pub mod rank;
pub mod task;
