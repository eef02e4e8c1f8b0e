//! Chapter generator: retrieval-grounded content for one chapter.

use crate::error::StageError;
use crate::llm::SharedGenerator;
use crate::retrieval::{rank, ContextPack, ScopeFilter, SharedRetriever};
use crate::task::{Chapter, CreativeBrief, Outline};

use super::prompts;

#[derive(Debug, Clone)]
pub struct ChapterSettings {
    pub search_top_k: usize,
    pub snippet_budget_chars: usize,
    pub continuity_budget_chars: usize,
    pub summary_chars: usize,
    /// Ask the model for summaries instead of truncating content.
    pub summarize: bool,
}

impl Default for ChapterSettings {
    fn default() -> Self {
        Self {
            search_top_k: 5,
            snippet_budget_chars: 6000,
            continuity_budget_chars: 1200,
            summary_chars: 200,
            summarize: false,
        }
    }
}

/// What one successful generation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterDraft {
    /// Raw model output.
    pub content: String,
    pub summary: String,
    pub grounded_snippets: usize,
    /// Set when retrieval failed and the chapter was written ungrounded.
    pub retrieval_error: Option<String>,
}

pub struct ChapterGenerator {
    generator: SharedGenerator,
    retriever: SharedRetriever,
    settings: ChapterSettings,
}

impl ChapterGenerator {
    pub fn new(generator: SharedGenerator, retriever: SharedRetriever, settings: ChapterSettings) -> Self {
        Self {
            generator,
            retriever,
            settings,
        }
    }

    /// Generate `chapter_id` from the current outline. Earlier chapters'
    /// summaries provide continuity.
    pub async fn generate(
        &self,
        brief: &CreativeBrief,
        outline: &Outline,
        chapter_id: &str,
    ) -> Result<ChapterDraft, StageError> {
        let chapter = outline
            .chapters
            .iter()
            .find(|c| c.chapter_id == chapter_id)
            .ok_or_else(|| StageError::Content(format!("chapter {} not in outline", chapter_id)))?;

        let query = retrieval_query(&brief.project_name, chapter);
        let scope = ScopeFilter::for_project(&brief.project_name);
        let (pack, retrieval_error) = match self
            .retriever
            .search(&query, self.settings.search_top_k, scope.as_ref())
            .await
        {
            Ok(snippets) => {
                let ranked = rank(snippets, self.settings.search_top_k);
                (
                    ContextPack::pack(&query, ranked, self.settings.snippet_budget_chars),
                    None,
                )
            }
            Err(e) => {
                tracing::warn!("Retrieval failed for {}, writing ungrounded: {}", chapter_id, e);
                (ContextPack::default(), Some(e.to_string()))
            }
        };
        if pack.is_empty() && retrieval_error.is_none() {
            tracing::debug!("No snippets for {} ({}), writing ungrounded", chapter_id, query);
        }

        let continuity = continuity_summary(
            outline,
            chapter_id,
            self.settings.continuity_budget_chars,
            self.settings.summary_chars,
        );
        let prompt = prompts::chapter(brief, outline, chapter, &continuity);
        let context = pack.format_for_prompt();
        let context = (!context.is_empty()).then_some(context.as_str());

        let content = self.generator.complete(&prompt, context).await?;
        if content.trim().is_empty() {
            return Err(StageError::Content(format!("empty content for {}", chapter_id)));
        }

        let summary = self.summarize(brief, chapter, &content).await;

        Ok(ChapterDraft {
            content,
            summary,
            grounded_snippets: pack.snippets.len(),
            retrieval_error,
        })
    }

    async fn summarize(&self, brief: &CreativeBrief, chapter: &Chapter, content: &str) -> String {
        if self.settings.summarize {
            let prompt = prompts::summary(chapter, content, brief.language());
            match self.generator.complete(&prompt, None).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    return truncate_summary(&summary, self.settings.summary_chars);
                }
                Ok(_) => tracing::warn!("Empty summary for {}, truncating content", chapter.chapter_id),
                Err(e) => tracing::warn!(
                    "Summary failed for {}, truncating content: {}",
                    chapter.chapter_id,
                    e
                ),
            }
        }
        truncate_summary(content, self.settings.summary_chars)
    }
}

/// `"{project} {title} {key points}"`, trimmed.
fn retrieval_query(project: &str, chapter: &Chapter) -> String {
    let mut parts = vec![project.trim(), chapter.title.trim()];
    parts.extend(chapter.key_points.iter().map(|p| p.trim()));
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Flatten whitespace and cut to `max_chars`.
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    crate::task::types::preview(&flat, max_chars)
}

/// Summaries of generated chapters before `chapter_id`, most recent kept
/// first when the budget runs out, returned in outline order. Chapters
/// without a stored summary fall back to `summary_chars` of their content.
pub fn continuity_summary(
    outline: &Outline,
    chapter_id: &str,
    budget_chars: usize,
    summary_chars: usize,
) -> String {
    let Some(position) = outline.chapters.iter().position(|c| c.chapter_id == chapter_id) else {
        return String::new();
    };

    let mut lines = Vec::new();
    let mut used = 0;
    for chapter in outline.chapters[..position].iter().rev() {
        if !chapter.is_generated() {
            continue;
        }
        let summary = match &chapter.summary {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => truncate_summary(chapter.content.as_deref().unwrap_or_default(), summary_chars),
        };
        let line = format!("- {}: {}", chapter.title, summary);
        let len = line.chars().count();
        if used + len > budget_chars {
            break;
        }
        used += len;
        lines.push(line);
    }

    lines.reverse();
    lines.join("\n")
}
