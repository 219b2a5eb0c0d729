use crate::config::Config;
use crate::models::{Chapter, ChapterOutcome, ChapterStats};
use crate::services::llm::{Oracle, respond_within};
use crate::services::recap::RecapStore;
use crate::services::{chunker, markup, template};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const SNIPPET_CHARS: usize = 150;

/// Tail of the most recent rewritten text, at most 150 characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationSnippet(String);

impl ContinuationSnippet {
    pub fn from_output(output: &str) -> Self {
        let trimmed = output.trim();
        let skip = trimmed.chars().count().saturating_sub(SNIPPET_CHARS);
        Self(trimmed.chars().skip(skip).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rewrites one chapter chunk by chunk, threading recap and continuation
/// snippet from each call into the next.
pub struct ChapterProcessor<'a, O: ?Sized> {
    config: &'a Config,
    oracle: &'a O,
}

impl<'a, O: Oracle + ?Sized> ChapterProcessor<'a, O> {
    pub fn new(config: &'a Config, oracle: &'a O) -> Self {
        Self { config, oracle }
    }

    fn timeout(&self) -> Option<Duration> {
        match self.config.llm.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Never fails: a chunk whose call errors is dropped from the output.
    #[instrument(skip_all, fields(chapter = %chapter.name))]
    pub async fn process(&self, chapter: &Chapter, recap_in: &str) -> ChapterOutcome {
        let text = markup::extract_text(&chapter.markup);
        let mut recap = RecapStore::new(recap_in, self.config);
        let mut stats = ChapterStats::default();
        let mut output = String::new();

        let mut snippet = if recap.is_beginning() {
            ContinuationSnippet::default()
        } else {
            ContinuationSnippet::from_output(recap.text())
        };

        let mut chunks = chunker::split(&text, self.config.chunk_size).peekable();
        // a recap carried in over budget is condensed before its first use
        if chunks.peek().is_some() && recap.ensure_within_budget(self.oracle, self.timeout()).await {
            stats.condensations += 1;
        }

        for (index, chunk) in chunks.enumerate() {
            stats.chunks += 1;
            let prompt = self.build_prompt(chunk, &snippet, &recap);
            debug!(chunk = index, chars = chunk.chars().count(), "Rewriting chunk");

            let rewritten = match respond_within(self.oracle, &prompt, self.timeout()).await {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    warn!(chunk = index, error = %e, "Error communicating with the LLM; skipping this chunk");
                    stats.dropped_chunks += 1;
                    continue;
                }
            };

            output.push_str(&rewritten);
            output.push_str("\n\n");
            snippet = ContinuationSnippet::from_output(&rewritten);

            recap.append(&rewritten);
            if recap.ensure_within_budget(self.oracle, self.timeout()).await {
                stats.condensations += 1;
            }
        }

        info!(
            chunks = stats.chunks,
            dropped = stats.dropped_chunks,
            condensations = stats.condensations,
            "Chapter rewritten"
        );

        ChapterOutcome {
            fragment: markup::render_fragment(&chapter.title, &output),
            recap: recap.into_text(),
            stats,
        }
    }

    fn build_prompt(&self, chunk: &str, snippet: &ContinuationSnippet, recap: &RecapStore) -> String {
        let prompts = &self.config.prompts;
        let continuation = if snippet.is_empty() {
            String::new()
        } else {
            template::fill(&prompts.continuation_template, &[("snippet", snippet.as_str())])
        };

        let task = template::fill(
            &prompts.task_template,
            &[("chunk", chunk), ("continuation_instruction", continuation.as_str())],
        );
        let body = match recap.prompt_section() {
            Some(section) => format!("{section}\n\n{task}"),
            None => task,
        };
        format!("{}\n\n{}", prompts.system, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BEGINNING_OF_BOOK;
    use crate::services::llm::OracleError;
    use crate::services::llm::mock::ScriptedOracle;

    fn chapter(paragraphs: &[&str]) -> Chapter {
        let body: String = paragraphs.iter().map(|p| format!("<p>{p}</p>")).collect();
        Chapter {
            name: "ch1.xhtml".to_string(),
            title: "One".to_string(),
            markup: format!("<html><body>{body}</body></html>"),
        }
    }

    fn small_config(max_recap_size: usize) -> Config {
        Config {
            chunk_size: 30,
            max_recap_size,
            ..Config::default()
        }
    }

    fn chunk_of(prompt: &str) -> String {
        let start = prompt.find("TEXT CHUNK TO REWRITE:\n```\n").unwrap() + 27;
        let end = start + prompt[start..].find("\n```").unwrap();
        prompt[start..end].to_string()
    }

    #[test]
    fn snippet_keeps_last_150_chars() {
        let long = format!("{}{}", "x".repeat(200), "y".repeat(150));
        assert_eq!(ContinuationSnippet::from_output(&long).as_str(), "y".repeat(150));
        assert_eq!(ContinuationSnippet::from_output("  short \n").as_str(), "short");
    }

    #[tokio::test]
    async fn rewrites_every_chunk_in_order() {
        let config = small_config(0);
        let oracle = ScriptedOracle::new(|p| Ok(format!("R[{}]", chunk_of(p))));
        let processor = ChapterProcessor::new(&config, &oracle);

        let outcome = processor
            .process(&chapter(&["Alpha paragraph text.", "Beta paragraph text."]), BEGINNING_OF_BOOK)
            .await;

        assert_eq!(outcome.stats.chunks, 2);
        assert_eq!(
            outcome.fragment,
            "<h1>One</h1><p>R[Alpha paragraph text.]</p><p>R[Beta paragraph text.]</p>"
        );
        assert_eq!(outcome.recap, BEGINNING_OF_BOOK);
    }

    #[tokio::test]
    async fn first_chunk_of_book_has_no_continuation() {
        let config = small_config(0);
        let oracle = ScriptedOracle::new(|_| Ok("Rewritten ending.".to_string()));
        let processor = ChapterProcessor::new(&config, &oracle);

        processor
            .process(&chapter(&["Alpha paragraph text.", "Beta paragraph text."]), BEGINNING_OF_BOOK)
            .await;

        let prompts = oracle.prompts();
        assert!(!prompts[0].contains("seamlessly continue"));
        assert!(prompts[1].contains("ending snippet of the previous part: '...Rewritten ending.'"));
        assert!(!prompts[0].contains("STORY SO FAR"));
    }

    #[tokio::test]
    async fn first_chunk_of_later_chapter_continues_from_recap() {
        let config = small_config(1000);
        let oracle = ScriptedOracle::new(|_| Ok("ok".to_string()));
        let processor = ChapterProcessor::new(&config, &oracle);
        let recap_in = format!("{}The duel ended at dawn.", "z".repeat(300));

        processor.process(&chapter(&["Alpha paragraph text."]), &recap_in).await;

        let prompts = oracle.prompts();
        let prompt = &prompts[0];
        assert!(prompt.contains("STORY SO FAR"));
        assert!(prompt.contains(&recap_in));
        let tail = ContinuationSnippet::from_output(&recap_in);
        assert!(prompt.contains(&format!("'...{}'", tail.as_str())));
    }

    #[tokio::test]
    async fn failing_chunk_is_dropped_and_processing_continues() {
        let config = small_config(0);
        let oracle = ScriptedOracle::new(|p| {
            let chunk = chunk_of(p);
            if chunk.starts_with("Beta") {
                Err(OracleError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(format!("R[{chunk}]"))
            }
        });
        let processor = ChapterProcessor::new(&config, &oracle);

        let outcome = processor
            .process(
                &chapter(&["Alpha paragraph text.", "Beta paragraph text.", "Gamma paragraph text."]),
                BEGINNING_OF_BOOK,
            )
            .await;

        assert_eq!(oracle.prompts().len(), 3);
        assert_eq!(outcome.stats.dropped_chunks, 1);
        assert_eq!(
            outcome.fragment,
            "<h1>One</h1><p>R[Alpha paragraph text.]</p><p>R[Gamma paragraph text.]</p>"
        );
        // the chunk after the failure continues from the last successful output
        assert!(oracle.prompts()[2].contains("'...R[Alpha paragraph text.]'"));
    }

    #[tokio::test]
    async fn condenses_once_before_fourth_chunk() {
        let config = small_config(100);
        // three 46-char outputs push the recap to 46 * 3 + 4 = 142 chars
        let oracle = ScriptedOracle::new(|p| {
            if p.starts_with(&Config::default().prompts.condense_system) {
                Ok("Condensed.".to_string())
            } else {
                Ok(format!("{:<46}", chunk_of(p)).replace(' ', "."))
            }
        });
        let processor = ChapterProcessor::new(&config, &oracle);

        let outcome = processor
            .process(
                &chapter(&[
                    "Alpha paragraph text.",
                    "Beta paragraph text.",
                    "Gamma paragraph text.",
                    "Delta paragraph text.",
                ]),
                BEGINNING_OF_BOOK,
            )
            .await;

        let prompts = oracle.prompts();
        let condense_at: Vec<_> = prompts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.starts_with(&config.prompts.condense_system))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(condense_at, vec![3]);
        assert_eq!(outcome.stats.condensations, 1);
        assert!(prompts[4].contains("STORY SO FAR:\n```\nCondensed."));
        assert!(outcome.recap.starts_with("Condensed.\n\nDelta"));
    }

    #[tokio::test]
    async fn oversized_incoming_recap_is_condensed_before_first_chunk() {
        let config = small_config(100);
        let oracle = ScriptedOracle::new(|p| {
            if p.starts_with(&Config::default().prompts.condense_system) {
                Ok("Condensed.".to_string())
            } else {
                Ok("ok".to_string())
            }
        });
        let processor = ChapterProcessor::new(&config, &oracle);
        let recap_in = format!("{}The duel ended at dawn.", "z".repeat(300));

        let outcome = processor.process(&chapter(&["Alpha paragraph text."]), &recap_in).await;

        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with(&config.prompts.condense_system));
        assert!(prompts[1].contains("STORY SO FAR:\n```\nCondensed."));
        assert!(!prompts[1].contains(&recap_in));
        // the snippet still comes from the text that was actually written last
        assert!(prompts[1].contains("The duel ended at dawn.'"));
        assert_eq!(outcome.stats.condensations, 1);
        assert_eq!(outcome.recap, "Condensed.\n\nok");
    }

    struct StallsOnBeta;

    #[async_trait::async_trait]
    impl Oracle for StallsOnBeta {
        async fn respond(&self, prompt: &str) -> Result<String, OracleError> {
            let chunk = chunk_of(prompt);
            if chunk.starts_with("Beta") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(format!("R[{chunk}]"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_chunk_is_dropped() {
        let mut config = small_config(0);
        config.llm.request_timeout_secs = 5;
        let processor = ChapterProcessor::new(&config, &StallsOnBeta);

        let outcome = processor
            .process(
                &chapter(&["Alpha paragraph text.", "Beta paragraph text.", "Gamma paragraph text."]),
                BEGINNING_OF_BOOK,
            )
            .await;

        assert_eq!(outcome.stats.chunks, 3);
        assert_eq!(outcome.stats.dropped_chunks, 1);
        assert_eq!(
            outcome.fragment,
            "<h1>One</h1><p>R[Alpha paragraph text.]</p><p>R[Gamma paragraph text.]</p>"
        );
    }

    #[tokio::test]
    async fn empty_chapter_makes_no_calls() {
        let config = small_config(100);
        let oracle = ScriptedOracle::new(|_| Ok("x".to_string()));
        let processor = ChapterProcessor::new(&config, &oracle);

        let outcome = processor.process(&chapter(&[]), "Earlier events.").await;

        assert!(oracle.prompts().is_empty());
        assert_eq!(outcome.fragment, "<h1>One</h1>");
        assert_eq!(outcome.recap, "Earlier events.");
    }
}
