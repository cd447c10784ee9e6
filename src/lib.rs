//! FeedForge
//!
//! Ingests threat feeds, filters them against allow-lists, stores indicators
//! with per-source provenance and renders firewall block-lists.

pub mod api;
pub mod collectors;
pub mod config;
pub mod dedup;
pub mod enrichment;
pub mod error;
pub mod export;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod whitelist;
