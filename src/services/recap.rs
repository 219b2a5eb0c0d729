use crate::config::Config;
use crate::models::BEGINNING_OF_BOOK;
use crate::services::llm::{Oracle, respond_within};
use crate::services::template;
use std::time::Duration;

/// Rolling "story so far", kept under `max_recap_size` characters by asking
/// the LLM to condense it.
pub struct RecapStore<'a> {
    text: String,
    config: &'a Config,
}

impl<'a> RecapStore<'a> {
    pub fn new(recap: &str, config: &'a Config) -> Self {
        Self {
            text: recap.to_string(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.recap_enabled()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_beginning(&self) -> bool {
        self.text == BEGINNING_OF_BOOK
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Context section for chunk prompts, or `None` when the recap is disabled.
    pub fn prompt_section(&self) -> Option<String> {
        self.enabled().then(|| {
            template::fill(
                &self.config.prompts.recap_section_template,
                &[("recap", self.text.as_str())],
            )
        })
    }

    pub fn append(&mut self, chunk_output: &str) {
        if !self.enabled() {
            return;
        }
        if self.is_beginning() {
            self.text = chunk_output.to_string();
        } else {
            self.text.push_str("\n\n");
            self.text.push_str(chunk_output);
        }
    }

    pub fn over_budget(&self) -> bool {
        self.enabled() && self.text.chars().count() > self.config.max_recap_size
    }

    /// Condenses the recap when over budget. Returns whether a condensation
    /// request was sent. A failed or useless condensation keeps the old recap.
    pub async fn ensure_within_budget<O: Oracle + ?Sized>(
        &mut self,
        oracle: &O,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.over_budget() {
            return false;
        }

        let before = self.text.chars().count();
        tracing::info!(
            chars = before,
            max = self.config.max_recap_size,
            "Recap has exceeded max length, condensing"
        );

        let prompts = &self.config.prompts;
        let prompt = format!(
            "{}\n\n{}",
            prompts.condense_system,
            template::fill(&prompts.condense_template, &[("recap", self.text.as_str())])
        );

        match respond_within(oracle, &prompt, timeout).await {
            Ok(condensed) => {
                let condensed = condensed.trim();
                let after = condensed.chars().count();
                if condensed.is_empty() || after >= before {
                    tracing::warn!(before, after, "Condensed recap is not shorter; keeping original");
                } else {
                    tracing::info!(before, after, "Recap condensed");
                    self.text = condensed.to_string();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not condense recap; keeping original");
            }
        }
        true
    }
}
