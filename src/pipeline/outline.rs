//! Outline generation and bounded self-critique refinement.
//!
//! The generator assigns chapter ids itself (`ch_01`, `ch_02`, ...); ids the
//! model invents are ignored. A refinement round has two parts: structural
//! changes proposed by the review, applied by the pure [`apply_changes`]
//! which keeps pinned chapters at the outline's ends, and gap filling, where
//! the review's search keywords are looked up in the knowledge base and the
//! findings are folded back into chapter key points.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::StageError;
use crate::llm::SharedGenerator;
use crate::retrieval::{rank, ContextPack, ScopeFilter, SharedRetriever};
use crate::task::types::string_or_list;
use crate::task::{chapter_id, Chapter, CreativeBrief, Outline};

use super::{complete_json, complete_json_with_context, prompts};

/// Upper bound on outline size after refinement.
pub const MAX_CHAPTERS: usize = 30;

/// Fewest key points a chapter may carry.
pub const MIN_KEY_POINTS: usize = 2;

/// Searches per refinement round.
const MAX_GAP_QUERIES: usize = 10;

#[derive(Debug, Deserialize)]
struct OutlineReply {
    #[serde(default)]
    chapters: Vec<DraftChapter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftChapter {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "key_points", deserialize_with = "string_or_list")]
    key_points: Vec<String>,
}

impl OutlineReply {
    fn validate(&self) -> Result<(), String> {
        if self.chapters.is_empty() {
            return Err("outline has no chapters".to_string());
        }
        if self.chapters.iter().any(|c| c.title.trim().is_empty()) {
            return Err("every chapter needs a title".to_string());
        }
        if let Some(thin) = self
            .chapters
            .iter()
            .find(|c| clean_key_points(&c.key_points, usize::MAX).len() < MIN_KEY_POINTS)
        {
            return Err(format!(
                "chapter \"{}\" needs at least {} key points",
                thin.title.trim(),
                MIN_KEY_POINTS
            ));
        }
        Ok(())
    }
}

fn clean_key_points(points: &[String], max: usize) -> Vec<String> {
    points
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .take(max)
        .map(str::to_string)
        .collect()
}

/// Cleaned `points`, topped up from `fallback` to [`MIN_KEY_POINTS`].
fn with_fallback_points(points: &[String], fallback: &[&str], max: usize) -> Vec<String> {
    let mut out = clean_key_points(points, max.max(MIN_KEY_POINTS));
    for extra in fallback {
        if out.len() >= MIN_KEY_POINTS {
            break;
        }
        if !out.iter().any(|p| p == extra) {
            out.push(extra.to_string());
        }
    }
    out
}

pub struct OutlineGenerator {
    generator: SharedGenerator,
    max_key_points: usize,
}

impl OutlineGenerator {
    pub fn new(generator: SharedGenerator, max_key_points: usize) -> Self {
        Self {
            generator,
            max_key_points: max_key_points.max(MIN_KEY_POINTS),
        }
    }

    /// Generate the initial outline. Every chapter starts without content.
    pub async fn generate(&self, brief: &CreativeBrief) -> Result<Outline, StageError> {
        let prompt = prompts::outline(brief, self.max_key_points);
        let reply: OutlineReply =
            complete_json(self.generator.as_ref(), &prompt, OutlineReply::validate).await?;

        let chapters = reply
            .chapters
            .iter()
            .take(MAX_CHAPTERS)
            .enumerate()
            .map(|(i, c)| {
                Chapter::new(
                    chapter_id(i + 1),
                    c.title.trim().to_string(),
                    clean_key_points(&c.key_points, self.max_key_points),
                )
            })
            .collect();

        Ok(Outline::initial(chapters))
    }
}

/// Three-chapter outline used when generation keeps producing unusable output.
pub fn default_outline(brief: &CreativeBrief, max_key_points: usize) -> Outline {
    let goal = vec![brief.document_goal.clone()];
    let body = if brief.main_content_directions.is_empty() {
        &brief.key_focus_areas
    } else {
        &brief.main_content_directions
    };

    Outline::initial(vec![
        Chapter::new(
            chapter_id(1),
            "概述".to_string(),
            with_fallback_points(&goal, &["项目背景", "编制依据"], max_key_points),
        ),
        Chapter::new(
            chapter_id(2),
            "主要内容".to_string(),
            with_fallback_points(body, &["工作内容", "实施要点"], max_key_points),
        ),
        Chapter::new(
            chapter_id(3),
            "总结与展望".to_string(),
            vec!["总结".to_string(), "展望".to_string()],
        ),
    ])
}

/// One edit proposed by an outline review.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutlineChange {
    #[serde(rename_all = "camelCase")]
    Insert {
        #[serde(default)]
        after: Option<String>,
        title: String,
        #[serde(default, alias = "key_points", deserialize_with = "string_or_list")]
        key_points: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Remove {
        #[serde(alias = "chapter_id")]
        chapter_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Move {
        #[serde(alias = "chapter_id")]
        chapter_id: String,
        #[serde(default)]
        after: Option<String>,
    },
}

/// A chapter the review wants backed by external material.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineGap {
    #[serde(default, alias = "chapter_id")]
    pub chapter_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "query_keywords", deserialize_with = "string_or_list")]
    pub query_keywords: Vec<String>,
}

/// What one review round asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlineReview {
    pub changes: Vec<OutlineChange>,
    pub gaps: Vec<OutlineGap>,
}

#[derive(Debug, Deserialize)]
struct ReviewReply {
    changes: Vec<serde_json::Value>,
    #[serde(default, alias = "gaps_identified", alias = "gapsIdentified")]
    gaps: Vec<serde_json::Value>,
}

/// New key points for an existing chapter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPointUpdate {
    #[serde(alias = "chapter_id")]
    pub chapter_id: String,
    #[serde(default, alias = "key_points", deserialize_with = "string_or_list")]
    pub key_points: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EnrichReply {
    chapters: Vec<serde_json::Value>,
}

/// Knowledge found for a review's gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Research {
    pub material: ContextPack,
    /// Scoped queries that were sent, in order.
    pub queries: Vec<String>,
    /// First search failure; the other searches still ran.
    pub retrieval_error: Option<String>,
}

/// Result of applying one review round.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementRound {
    pub chapters: Vec<Chapter>,
    /// Number of changes that actually altered the outline.
    pub applied: usize,
    /// Id counter after this round's inserts.
    pub next_chapter_seq: usize,
}

/// Decode each entry on its own; malformed ones are logged and dropped.
fn parse_entries<T: DeserializeOwned>(values: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Ignoring malformed {} {}: {}", what, value, e);
                None
            }
        })
        .collect()
}

fn scoped_query(project: &str, keyword: &str) -> String {
    format!("{} {}", project.trim(), keyword.trim()).trim().to_string()
}

pub struct OutlineRefiner {
    generator: SharedGenerator,
    retriever: SharedRetriever,
    search_top_k: usize,
    snippet_budget_chars: usize,
}

impl OutlineRefiner {
    pub fn new(
        generator: SharedGenerator,
        retriever: SharedRetriever,
        search_top_k: usize,
        snippet_budget_chars: usize,
    ) -> Self {
        Self {
            generator,
            retriever,
            search_top_k,
            snippet_budget_chars,
        }
    }

    /// Ask for one round of critique. Unrecognised entries are skipped.
    pub async fn review(
        &self,
        brief: &CreativeBrief,
        outline: &Outline,
    ) -> Result<OutlineReview, StageError> {
        let prompt = prompts::review(brief, outline);
        let reply: ReviewReply =
            complete_json(self.generator.as_ref(), &prompt, |_| Ok(())).await?;

        let gaps: Vec<OutlineGap> = parse_entries(reply.gaps, "outline gap");
        Ok(OutlineReview {
            changes: parse_entries(reply.changes, "outline change"),
            gaps: gaps
                .into_iter()
                .filter(|g| g.query_keywords.iter().any(|k| !k.trim().is_empty()))
                .collect(),
        })
    }

    /// Search the knowledge base for every gap keyword, scoped to the
    /// project. Search failures are reported, not raised.
    pub async fn research(&self, brief: &CreativeBrief, gaps: &[OutlineGap]) -> Research {
        let scope = ScopeFilter::for_project(&brief.project_name);
        let mut research = Research::default();
        let mut found = Vec::new();

        let keywords = gaps
            .iter()
            .flat_map(|g| g.query_keywords.iter())
            .filter(|k| !k.trim().is_empty());
        for keyword in keywords {
            let query = scoped_query(&brief.project_name, keyword);
            if research.queries.contains(&query) {
                continue;
            }
            if research.queries.len() >= MAX_GAP_QUERIES {
                tracing::debug!("Gap search limit reached, skipping '{}'", query);
                break;
            }
            match self
                .retriever
                .search(&query, self.search_top_k, scope.as_ref())
                .await
            {
                Ok(snippets) => found.extend(snippets),
                Err(e) => {
                    tracing::warn!("Gap search failed for '{}': {}", query, e);
                    research.retrieval_error.get_or_insert_with(|| e.to_string());
                }
            }
            research.queries.push(query);
        }

        // The same passage often answers several keywords.
        let mut seen = HashSet::new();
        found.retain(|s| seen.insert(s.text.trim().to_string()));
        let ranked = rank(found, usize::MAX);
        research.material =
            ContextPack::pack(&research.queries.join("; "), ranked, self.snippet_budget_chars);
        research
    }

    /// Fold `material` into the key points of the gap chapters.
    pub async fn enrich(
        &self,
        brief: &CreativeBrief,
        outline: &Outline,
        gaps: &[OutlineGap],
        material: &ContextPack,
    ) -> Result<Vec<KeyPointUpdate>, StageError> {
        let titles: Vec<String> = gaps
            .iter()
            .map(|g| {
                if g.title.trim().is_empty() {
                    g.chapter_id.clone()
                } else {
                    g.title.trim().to_string()
                }
            })
            .collect();
        let prompt = prompts::enrich(brief, outline, &titles);
        let context = material.format_for_prompt();
        let reply: EnrichReply = complete_json_with_context(
            self.generator.as_ref(),
            &prompt,
            Some(context.as_str()),
            |_| Ok(()),
        )
        .await?;
        Ok(parse_entries(reply.chapters, "key point update"))
    }
}

/// Apply `changes` to the outline's body. Pinned chapters are never removed
/// or moved and stay at the ends; inserts and moves land between them.
pub fn apply_changes(
    outline: &Outline,
    changes: &[OutlineChange],
    max_key_points: usize,
) -> RefinementRound {
    let pinned = &outline.metadata.pinned_chapter_ids;
    let is_pinned = |id: &str| pinned.iter().any(|p| p == id);
    let mut metadata = outline.metadata.clone();
    let mut chapters = outline.chapters.clone();
    let mut applied = 0;

    for change in changes {
        match change {
            OutlineChange::Remove { chapter_id } => {
                if is_pinned(chapter_id) {
                    tracing::debug!("Refusing to remove pinned chapter {}", chapter_id);
                    continue;
                }
                if let Some(pos) = chapters.iter().position(|c| &c.chapter_id == chapter_id) {
                    chapters.remove(pos);
                    applied += 1;
                }
            }
            OutlineChange::Insert {
                after,
                title,
                key_points,
            } => {
                let title = title.trim();
                if title.is_empty() || chapters.len() >= MAX_CHAPTERS {
                    continue;
                }
                let key_points = clean_key_points(key_points, max_key_points.max(MIN_KEY_POINTS));
                if key_points.len() < MIN_KEY_POINTS {
                    tracing::warn!(
                        "Skipping inserted chapter \"{}\" with {} key point(s)",
                        title,
                        key_points.len()
                    );
                    continue;
                }
                let id = metadata.allocate_chapter_id(&chapters);
                let pos = insertion_index(&chapters, pinned, after.as_deref());
                chapters.insert(pos, Chapter::new(id, title.to_string(), key_points));
                applied += 1;
            }
            OutlineChange::Move { chapter_id, after } => {
                if is_pinned(chapter_id) || after.as_deref() == Some(chapter_id.as_str()) {
                    continue;
                }
                let Some(from) = chapters.iter().position(|c| &c.chapter_id == chapter_id) else {
                    continue;
                };
                let chapter = chapters.remove(from);
                let to = insertion_index(&chapters, pinned, after.as_deref());
                chapters.insert(to, chapter);
                if to != from {
                    applied += 1;
                }
            }
        }
    }

    RefinementRound {
        chapters,
        applied,
        next_chapter_seq: metadata.next_chapter_seq,
    }
}

/// Replace key points of existing chapters. Returns how many chapters changed.
pub fn apply_key_point_updates(
    chapters: &mut [Chapter],
    updates: &[KeyPointUpdate],
    max_key_points: usize,
) -> usize {
    let mut changed = 0;
    for update in updates {
        let Some(chapter) = chapters.iter_mut().find(|c| c.chapter_id == update.chapter_id) else {
            tracing::debug!("Key points for unknown chapter {} ignored", update.chapter_id);
            continue;
        };
        let points = clean_key_points(&update.key_points, max_key_points.max(MIN_KEY_POINTS));
        if points.len() < MIN_KEY_POINTS {
            tracing::warn!(
                "Keeping key points of {}: update has only {}",
                chapter.chapter_id,
                points.len()
            );
            continue;
        }
        if chapter.key_points != points {
            chapter.key_points = points;
            changed += 1;
        }
    }
    changed
}

/// Where to insert after `after`, clamped to the unpinned body. A missing or
/// unknown anchor means the end of the body.
fn insertion_index(chapters: &[Chapter], pinned: &[String], after: Option<&str>) -> usize {
    let pinned_at = |i: usize| {
        chapters
            .get(i)
            .is_some_and(|c| pinned.iter().any(|p| p == &c.chapter_id))
    };
    let start = usize::from(pinned_at(0));
    let end = if chapters.len() > start && pinned_at(chapters.len() - 1) {
        chapters.len() - 1
    } else {
        chapters.len()
    };

    after
        .and_then(|id| chapters.iter().position(|c| c.chapter_id == id))
        .map(|i| i + 1)
        .unwrap_or(end)
        .clamp(start, end)
}
