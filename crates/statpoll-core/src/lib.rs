//! statpoll-core — shared library for the statpoll collector daemon.
//!
//! Provides:
//! - `stats` — the statistics data model (raw and derived stats, key
//!   metadata)
//! - `client` — the cluster statistics client and its REST transport
//! - `metadata` — metadata-driven update-interval resolution
//! - `derived` — derived-stat computers and the tiered pipeline
//! - `processor` — downstream processor traits and the batch/streaming
//!   adapter
//! - `daemon` — the scheduler and bounded query fan-out

pub mod client;
pub mod daemon;
pub mod derived;
pub mod metadata;
pub mod processor;
pub mod stats;
