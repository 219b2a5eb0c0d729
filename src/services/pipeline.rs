use crate::config::Config;
use crate::models::{Chapter, RunSummary, SummarizedChapter};
use crate::services::ledger::{LedgerError, ProgressLedger};
use crate::services::llm::Oracle;
use crate::services::processor::ChapterProcessor;
use tracing::{info, instrument};

#[derive(Debug)]
pub struct PipelineOutput {
    pub chapters: Vec<SummarizedChapter>,
    pub summary: RunSummary,
}

/// Walks the chapters in document order, skipping those the ledger already
/// has and committing each new one before moving on.
pub struct Pipeline<'a, O: ?Sized> {
    config: &'a Config,
    oracle: &'a O,
    ledger: &'a ProgressLedger,
}

impl<'a, O: Oracle + ?Sized> Pipeline<'a, O> {
    pub fn new(config: &'a Config, oracle: &'a O, ledger: &'a ProgressLedger) -> Self {
        Self {
            config,
            oracle,
            ledger,
        }
    }

    /// Only ledger I/O can fail the run.
    #[instrument(skip_all, fields(chapters = chapters.len(), ledger = %self.ledger.path().display()))]
    pub async fn run(&self, chapters: &[Chapter]) -> Result<PipelineOutput, LedgerError> {
        let mut record = self.ledger.load()?;
        let processor = ChapterProcessor::new(self.config, self.oracle);
        let mut summary = RunSummary::default();
        let mut output = Vec::with_capacity(chapters.len());
        let total = chapters.len();

        info!("Starting summarization process");
        for (index, chapter) in chapters.iter().enumerate() {
            let fragment = match record.processed_chapters.get(&chapter.name) {
                Some(stored) => {
                    info!(
                        chapter_no = index + 1,
                        total,
                        chapter = %chapter.name,
                        "Skipping already processed chapter"
                    );
                    summary.chapters_skipped += 1;
                    stored.clone()
                }
                None => {
                    info!(
                        chapter_no = index + 1,
                        total,
                        chapter = %chapter.name,
                        "Summarizing chapter"
                    );
                    let outcome = processor.process(chapter, &record.recap).await;
                    summary.record(outcome.stats);
                    record.recap = outcome.recap;
                    record
                        .processed_chapters
                        .insert(chapter.name.clone(), outcome.fragment.clone());
                    self.ledger.save(&record)?;
                    outcome.fragment
                }
            };

            output.push(SummarizedChapter {
                name: chapter.name.clone(),
                title: chapter.title.clone(),
                fragment,
            });
        }

        info!(
            processed = summary.chapters_processed,
            skipped = summary.chapters_skipped,
            dropped_chunks = summary.dropped_chunks,
            "Summarization complete"
        );
        Ok(PipelineOutput {
            chapters: output,
            summary,
        })
    }
}
