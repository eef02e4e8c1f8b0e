//! Pipeline stages.
//!
//! Each stage is a small struct over the collaborators it needs. Stages never
//! touch the task store; they take the data they need and return what they
//! produced, and the orchestrator persists it.

mod assemble;
mod brief;
mod chapters;
pub mod json;
mod outline;
pub mod prompts;

pub use assemble::assemble;
pub use brief::BriefAnalyzer;
pub use chapters::{continuity_summary, truncate_summary, ChapterDraft, ChapterGenerator, ChapterSettings};
pub use outline::{
    apply_changes, apply_key_point_updates, default_outline, KeyPointUpdate, OutlineChange,
    OutlineGap, OutlineGenerator, OutlineRefiner, OutlineReview, RefinementRound, Research,
    MIN_KEY_POINTS,
};

use serde::de::DeserializeOwned;

use crate::error::StageError;
use crate::llm::TextGenerator;

/// Ask for a JSON object, retrying once with a stricter prompt when the
/// answer cannot be parsed or fails `validate`.
///
/// Transient failures are returned as-is; backoff is the caller's job.
pub(crate) async fn complete_json<T, F>(
    generator: &dyn TextGenerator,
    prompt: &str,
    validate: F,
) -> Result<T, StageError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), String>,
{
    complete_json_with_context(generator, prompt, None, validate).await
}

/// [`complete_json`] with grounding `context` sent on both attempts.
pub(crate) async fn complete_json_with_context<T, F>(
    generator: &dyn TextGenerator,
    prompt: &str,
    context: Option<&str>,
    validate: F,
) -> Result<T, StageError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), String>,
{
    let parse = |raw: &str| -> Result<T, String> {
        let value: T = json::parse_json_object(raw)?;
        validate(&value)?;
        Ok(value)
    };

    let raw = generator.complete(prompt, context).await?;
    let problem = match parse(&raw) {
        Ok(value) => return Ok(value),
        Err(problem) => problem,
    };

    tracing::warn!("Unusable JSON from model, retrying with corrective prompt: {}", problem);
    let raw = generator
        .complete(&prompts::corrective(prompt, &problem), context)
        .await?;
    parse(&raw).map_err(StageError::Content)
}
