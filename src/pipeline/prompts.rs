//! Prompt templates for every collaborator call.
//!
//! Each prompt opens with a fixed task line so logs (and test doubles) can
//! tell the calls apart.

use crate::task::{Chapter, CreativeBrief, InitialRequest, Outline};

pub const BRIEF_TASK: &str = "Task: creative brief";
pub const OUTLINE_TASK: &str = "Task: document outline";
pub const REVIEW_TASK: &str = "Task: outline review";
pub const ENRICH_TASK: &str = "Task: outline enrichment";
pub const CHAPTER_TASK: &str = "Task: chapter draft";
pub const SUMMARY_TASK: &str = "Task: chapter summary";

/// Appended to a prompt whose previous answer could not be parsed.
pub fn corrective(prompt: &str, problem: &str) -> String {
    format!(
        "{}\n\nYour previous answer could not be used: {}\n\
         Reply with exactly one JSON object and nothing else. \
         No markdown fences, no commentary, no trailing text.",
        prompt, problem
    )
}

pub fn brief(request: &InitialRequest) -> String {
    let history = if request.chat_history.trim().is_empty() {
        "(none)"
    } else {
        request.chat_history.trim()
    };
    format!(
        r#"{task}

You are a planning assistant. Distil the conversation and the user's final
request below into a creative brief that will guide the writing of a long
document.

Conversation so far:
{history}

Final request:
{request}

Reply with a JSON object with these keys:
- "projectName": short core topic of the document, used to scope knowledge-base searches
- "documentType": kind of document (report, construction plan, proposal, ...)
- "documentGoal": what the document must achieve
- "mainContentDirections": list of main content directions
- "targetAudience": who will read it
- "writingStyle": {{"tone": "...", "language": "...", "format": "...", "specialRequirements": ["..."]}}
- "keyFocusAreas": list of points needing particular depth
- "expectedLength": rough expected length
- "structure": list of suggested top-level parts

Write every text value in the language of the user's request."#,
        task = BRIEF_TASK,
        history = history,
        request = request.request.trim(),
    )
}

pub fn outline(brief: &CreativeBrief, max_key_points: usize) -> String {
    format!(
        r#"{task}

Create the chapter outline of a long document from this creative brief:
{brief}

Rules:
- The first chapter is an overview and the last chapter is a summary and outlook.
- Body chapters in between cover the main content directions in a logical order.
- Every chapter has a concise title and 2 to {max} key points (short phrases).
- Do not write any chapter content.

Reply with a JSON object: {{"chapters": [{{"title": "...", "keyPoints": ["..."]}}]}}
Write all titles and key points in {language}."#,
        task = OUTLINE_TASK,
        brief = brief_json(brief),
        max = max_key_points.max(2),
        language = brief.language(),
    )
}

pub fn review(brief: &CreativeBrief, outline: &Outline) -> String {
    let pinned = outline.metadata.pinned_chapter_ids.join(", ");
    format!(
        r#"{task}

You are a demanding senior editor. Review the outline below against the
creative brief. Look for missing topics, redundant chapters and chapters in
the wrong order.

Creative brief:
{brief}

Current outline:
{outline}

Also ask yourself which chapters would gain depth from concrete external
data, cases or details, and name search keywords for them.

Reply with a JSON object:
{{"changes": [
  {{"action": "insert", "after": "<chapterId>", "title": "...", "keyPoints": ["...", "..."]}},
  {{"action": "remove", "chapterId": "<chapterId>"}},
  {{"action": "move", "chapterId": "<chapterId>", "after": "<chapterId>"}}
],
 "gaps": [
  {{"chapterId": "<chapterId>", "title": "...", "queryKeywords": ["..."]}}
]}}

Chapters {pinned} are fixed: never remove or move them.
New chapters need at least 2 key points.
If the outline is complete, reply with {{"changes": [], "gaps": []}}.
Write new titles, key points and keywords in {language}."#,
        task = REVIEW_TASK,
        brief = brief_json(brief),
        outline = outline_listing(&outline.chapters),
        pinned = if pinned.is_empty() { "(none)".to_string() } else { pinned },
        language = brief.language(),
    )
}

pub fn enrich(brief: &CreativeBrief, outline: &Outline, gap_titles: &[String]) -> String {
    format!(
        r#"{task}

Using the reference material provided, deepen the key points of the outline
below, especially for these chapters: {gaps}.

Creative brief:
{brief}

Current outline:
{outline}

Reply with a JSON object listing only the chapters whose key points change:
{{"chapters": [{{"chapterId": "<chapterId>", "keyPoints": ["...", "..."]}}]}}
Keep every chapter id as given; do not add or remove chapters.
Give each listed chapter 2 to 4 key points, written in {language}."#,
        task = ENRICH_TASK,
        gaps = gap_titles.join(", "),
        brief = brief_json(brief),
        outline = outline_listing(&outline.chapters),
        language = brief.language(),
    )
}

pub fn chapter(brief: &CreativeBrief, outline: &Outline, chapter: &Chapter, continuity: &str) -> String {
    let key_points = if chapter.key_points.is_empty() {
        "(none listed; cover the title thoroughly)".to_string()
    } else {
        chapter
            .key_points
            .iter()
            .map(|p| format!("- {}", p))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let continuity = if continuity.trim().is_empty() {
        "(this is the first chapter written)"
    } else {
        continuity
    };

    format!(
        r#"{task}

Write the full content of one chapter of a long document.

Creative brief:
{brief}

Full outline:
{outline}

Chapter: {id} {title}
Key points to develop:
{key_points}

Already written chapters, in brief:
{continuity}

Rules:
- Do not repeat the chapter title as a heading; it is added later.
- Use third-level headings (###) or lower for any internal structure.
- Base facts on the reference material when it is provided.
- Write the chapter in {language}."#,
        task = CHAPTER_TASK,
        brief = brief_json(brief),
        outline = outline_listing(&outline.chapters),
        id = chapter.chapter_id,
        title = chapter.title,
        key_points = key_points,
        continuity = continuity,
        language = brief.language(),
    )
}

pub fn summary(chapter: &Chapter, content: &str, language: &str) -> String {
    format!(
        "{task}\n\nSummarise the chapter \"{title}\" below in one or two sentences, in {language}. \
         Reply with the summary text only.\n\n{content}",
        task = SUMMARY_TASK,
        title = chapter.title,
        language = language,
        content = content,
    )
}

fn brief_json(brief: &CreativeBrief) -> String {
    serde_json::to_string_pretty(brief).unwrap_or_else(|_| format!("{:?}", brief))
}

/// One line per chapter: `ch_01 Title: point; point`.
fn outline_listing(chapters: &[Chapter]) -> String {
    chapters
        .iter()
        .map(|c| {
            if c.key_points.is_empty() {
                format!("{} {}", c.chapter_id, c.title)
            } else {
                format!("{} {}: {}", c.chapter_id, c.title, c.key_points.join("; "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
