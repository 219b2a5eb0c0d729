use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recap value before any chunk has been rewritten.
pub const BEGINNING_OF_BOOK: &str = "This is the beginning of the book.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Manifest href; stable across runs and used as the ledger key.
    pub name: String,
    pub title: String,
    pub markup: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub language: Option<String>,
    pub creators: Vec<String>,
}

/// Non-document manifest item (image, stylesheet, font) carried into the output.
#[derive(Debug, Clone)]
pub struct Resource {
    pub href: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Book {
    pub metadata: BookMetadata,
    /// Spine order.
    pub chapters: Vec<Chapter>,
    pub resources: Vec<Resource>,
}

/// Durable state of a run: the rolling recap and every finished chapter's fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default = "beginning_of_book")]
    pub recap: String,
    #[serde(default)]
    pub processed_chapters: BTreeMap<String, String>,
}

fn beginning_of_book() -> String {
    BEGINNING_OF_BOOK.to_string()
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            recap: beginning_of_book(),
            processed_chapters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChapterStats {
    pub chunks: usize,
    pub dropped_chunks: usize,
    pub condensations: usize,
}

/// Rewritten chapter ready for the output book.
#[derive(Debug, Clone)]
pub struct SummarizedChapter {
    pub name: String,
    pub title: String,
    pub fragment: String,
}

#[derive(Debug, Clone)]
pub struct ChapterOutcome {
    pub fragment: String,
    pub recap: String,
    pub stats: ChapterStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub chapters_processed: usize,
    pub chapters_skipped: usize,
    pub chunks: usize,
    pub dropped_chunks: usize,
    pub condensations: usize,
}

impl RunSummary {
    pub fn record(&mut self, stats: ChapterStats) {
        self.chapters_processed += 1;
        self.chunks += stats.chunks;
        self.dropped_chunks += stats.dropped_chunks;
        self.condensations += stats.condensations;
    }
}
