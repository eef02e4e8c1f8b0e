//! Types for the retrieval gateway.

use serde::{Deserialize, Serialize};

/// One ranked piece of knowledge-store text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    /// Higher is more relevant.
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Snippet {
    pub fn new(text: impl Into<String>, score: f64) -> Self {
        Self {
            text: text.into(),
            score,
            source: None,
        }
    }
}

/// Restricts a search to one project's material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub project: Option<String>,
}

impl ScopeFilter {
    /// Scope to `project`, or `None` when the name is blank.
    pub fn for_project(project: &str) -> Option<Self> {
        let project = project.trim();
        if project.is_empty() {
            None
        } else {
            Some(Self {
                project: Some(project.to_string()),
            })
        }
    }
}

/// Snippets selected for one prompt, within a character budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPack {
    pub snippets: Vec<Snippet>,
    pub total_chars: usize,
    pub query: String,
}

impl ContextPack {
    /// Take snippets in rank order, skipping any that would overflow `max_chars`.
    pub fn pack(query: &str, snippets: Vec<Snippet>, max_chars: usize) -> Self {
        let mut selected = Vec::new();
        let mut total_chars = 0;

        for snippet in snippets {
            let text = snippet.text.trim();
            if text.is_empty() {
                continue;
            }
            let len = text.chars().count();
            if total_chars + len > max_chars {
                tracing::debug!("Skipping {}-char snippet over the remaining budget", len);
                continue;
            }
            total_chars += len;
            selected.push(snippet);
        }

        Self {
            snippets: selected,
            total_chars,
            query: query.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Format as a string for prompt injection.
    pub fn format_for_prompt(&self) -> String {
        if self.snippets.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Reference material from the knowledge base\n\n");
        for (i, snippet) in self.snippets.iter().enumerate() {
            out.push_str(&format!(
                "### Reference {} (relevance: {:.2})\n{}\n\n",
                i + 1,
                snippet.score,
                snippet.text.trim()
            ));
        }
        out
    }
}
