//! Rewrites an EPUB into a much shorter book, one LLM call per chunk, with a
//! rolling recap for continuity and a progress ledger for resuming.

pub mod config;
pub mod models;
pub mod server;
pub mod services;
