use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which HTTP dialect the LLM backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFlavor {
    /// Ollama's `/api/generate`.
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions` (LM Studio, vLLM, ...).
    OpenAi,
}

impl std::str::FromStr for ApiFlavor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ApiFlavor::Ollama),
            "openai" | "lmstudio" => Ok(ApiFlavor::OpenAi),
            other => bail!("unknown LLM API flavor '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub flavor: ApiFlavor,
    pub temperature: f32,
    /// Per-call timeout; 0 waits forever.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "qwen3:4b".to_string(),
            flavor: ApiFlavor::Ollama,
            temperature: 0.3,
            request_timeout_secs: 600,
        }
    }
}

/// Instruction strings and templates. Placeholders are written `{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub system: String,
    /// Placeholders: `{chunk}`, `{continuation_instruction}`.
    pub task_template: String,
    /// Placeholder: `{snippet}`.
    pub continuation_template: String,
    /// Placeholder: `{recap}`.
    pub recap_section_template: String,
    pub condense_system: String,
    /// Placeholder: `{recap}`.
    pub condense_template: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system: "You are a ruthless editor. Your sole mission is to drastically reduce a book's \
                     length to about 25% of its original size. Do not summarize. You must rewrite \
                     the story, but aggressively cut redundant language and dialogue, and \
                     non-essential subplots. Retain only the core narrative, character progression, \
                     and critical plot points. The final output must be a continuous, flowing \
                     story, not a list of events and not consisting of short sentences."
                .to_string(),
            task_template: "\nTASK:\nRewrite and shorten the following text chunk. Your rewritten \
                            version must be significantly shorter than the original. \
                            {continuation_instruction} Focus only on what is essential to move the \
                            story forward but write in full sentences.\n\nTEXT CHUNK TO REWRITE:\n\
                            ```\n{chunk}\n```\n\nREWRITTEN STORY (NO BULLETS, NO INTRODUCTORY \
                            PHRASES LIKE \"Here is the rewritten text\"):"
                .to_string(),
            continuation_template: "\nYour response should seamlessly continue the story from this \
                                    ending snippet of the previous part: '...{snippet}'\n"
                .to_string(),
            recap_section_template: "CONTEXT:\nBelow is a summary of the story so far. It is \
                                     crucial that you use this context to inform your writing, \
                                     ensuring the narrative flows and remains consistent.\n\n\
                                     STORY SO FAR:\n```\n{recap}\n```\n"
                .to_string(),
            condense_system: "You are an expert at condensing summaries. Your task is to take a \
                              running summary and make it shorter, keeping only the most critical \
                              information needed to understand the next part of a story. The \
                              condensed summary must be at least 50% shorter than the original."
                .to_string(),
            condense_template: "\nThe following summary is becoming too long to be used as \
                                context. Please condense it significantly, retaining only the most \
                                essential plot points, characters, and setting details that are \
                                crucial for understanding what happens next in the book.\n\n\
                                TEXT TO CONDENSE:\n```\n{recap}\n```\n\nCONDENSED SUMMARY:"
                .to_string(),
        }
    }
}

/// Everything a run needs, built once and passed down by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Characters per chunk sent to the LLM.
    pub chunk_size: usize,
    /// Characters the recap may hold before it is condensed. 0 disables the recap.
    pub max_recap_size: usize,
    pub llm: LlmConfig,
    pub prompts: Prompts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            max_recap_size: 0,
            llm: LlmConfig::default(),
            prompts: Prompts::default(),
        }
    }
}

impl Config {
    /// Defaults, then the optional JSON file, then `LLM_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Some(key) = var("LLM_API_KEY").filter(|k| !k.is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(flavor) = var("LLM_API_FLAVOR") {
            self.llm.flavor = flavor.parse()?;
        }
        Ok(())
    }

    pub fn recap_enabled(&self) -> bool {
        self.max_recap_size > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be a positive number of characters");
        }
        let p = &self.prompts;
        require_placeholder("task_template", &p.task_template, "chunk")?;
        require_placeholder("continuation_template", &p.continuation_template, "snippet")?;
        if self.recap_enabled() {
            require_placeholder("recap_section_template", &p.recap_section_template, "recap")?;
            require_placeholder("condense_template", &p.condense_template, "recap")?;
        }
        Ok(())
    }
}

fn require_placeholder(field: &str, template: &str, name: &str) -> Result<()> {
    if !template.contains(&format!("{{{name}}}")) {
        bail!("prompts.{field} must contain the {{{name}}} placeholder");
    }
    Ok(())
}
