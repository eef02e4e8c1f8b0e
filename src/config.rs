//! Configuration.
//!
//! Connection settings come from environment variables; pipeline knobs come
//! from `{data_dir}/pipeline.json` when present, otherwise defaults.
//!
//! Environment:
//! - `LONGDOC_DATA_DIR` - root for task records and exports (default `./.longdoc`)
//! - `LONGDOC_LLM_BASE_URL` - OpenAI-compatible endpoint (default DeepSeek)
//! - `LONGDOC_LLM_API_KEY` - API key, falling back to `DEEPSEEK_API_KEY`
//! - `LONGDOC_MODEL` - model name (default `deepseek-chat`)
//! - `LONGDOC_TEMPERATURE`, `LONGDOC_MAX_TOKENS` - sampling options
//! - `LONGDOC_RETRIEVAL_URL` - knowledge-store base URL; unset disables retrieval

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::llm::{RetryConfig, DEFAULT_BASE_URL};
use crate::pipeline::ChapterSettings;

pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_DATA_DIR: &str = ".longdoc";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub retrieval_url: Option<String>,
    pub pipeline: PipelineSettings,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = PathBuf::from(var("LONGDOC_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let temperature = var("LONGDOC_TEMPERATURE")
            .map(|v| v.parse::<f64>())
            .transpose()
            .context("LONGDOC_TEMPERATURE must be a number")?;
        let max_tokens = var("LONGDOC_MAX_TOKENS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("LONGDOC_MAX_TOKENS must be a positive integer")?;

        let pipeline = PipelineSettings::load_or_default(&data_dir.join("pipeline.json"));

        Ok(Self {
            llm_base_url: var("LONGDOC_LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            llm_api_key: var("LONGDOC_LLM_API_KEY").or_else(|| var("DEEPSEEK_API_KEY")),
            model: var("LONGDOC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature,
            max_tokens,
            retrieval_url: var("LONGDOC_RETRIEVAL_URL"),
            pipeline,
            data_dir,
        })
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }
}

/// Tunables for the orchestrator and its stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_refinement_cycles: u32,
    pub stage_max_attempts: u32,
    pub chapter_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Chapters generated at once; 1 keeps strict outline order.
    pub chapter_concurrency: usize,
    pub search_top_k: usize,
    pub snippet_budget_chars: usize,
    pub continuity_budget_chars: usize,
    pub summary_chars: usize,
    pub max_key_points: usize,
    pub summarize_chapters: bool,
    /// Use the three-chapter default outline when generation fails.
    pub outline_fallback: bool,
    /// Also write completed documents to `{data_dir}/documents/<id>.md`.
    pub export_markdown: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_refinement_cycles: 3,
            stage_max_attempts: 3,
            chapter_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            chapter_concurrency: 1,
            search_top_k: 5,
            snippet_budget_chars: 6000,
            continuity_budget_chars: 1200,
            summary_chars: 200,
            max_key_points: 4,
            summarize_chapters: false,
            outline_fallback: false,
            export_markdown: false,
        }
    }
}

impl PipelineSettings {
    /// Load from `path`, falling back to defaults when missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No pipeline settings at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load_from_path(path) {
            Ok(settings) => {
                tracing::info!("Loaded pipeline settings from {}", path.display());
                settings
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load pipeline settings from {}: {}, using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    fn load_from_path(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn retry(&self, max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
        }
    }

    /// Backoff for the brief, outline, refinement and assembly stages.
    pub fn stage_retry(&self) -> RetryConfig {
        self.retry(self.stage_max_attempts)
    }

    pub fn chapter_retry(&self) -> RetryConfig {
        self.retry(self.chapter_max_attempts)
    }

    pub fn chapter_settings(&self) -> ChapterSettings {
        ChapterSettings {
            search_top_k: self.search_top_k.max(1),
            snippet_budget_chars: self.snippet_budget_chars,
            continuity_budget_chars: self.continuity_budget_chars,
            summary_chars: self.summary_chars.max(1),
            summarize: self.summarize_chapters,
        }
    }
}
