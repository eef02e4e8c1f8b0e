//! Assembler: chapters in outline order -> final Markdown document.
//!
//! Only top-level `## n. Title` headers are added. Chapter content is
//! inserted as written, so any numbering inside a chapter is left alone.

use crate::error::StageError;
use crate::task::Chapter;

pub fn assemble(title: &str, chapters: &[Chapter]) -> Result<String, StageError> {
    if chapters.is_empty() {
        return Err(StageError::Content("outline has no chapters".to_string()));
    }

    let mut out = String::new();
    let title = title.trim();
    if !title.is_empty() {
        out.push_str(&format!("# {}\n\n", title));
    }

    for (i, chapter) in chapters.iter().enumerate() {
        let content = chapter
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                StageError::Content(format!("chapter {} has no content", chapter.chapter_id))
            })?;
        out.push_str(&format!("## {}. {}\n\n", i + 1, chapter.title.trim()));
        out.push_str(content.trim_end());
        out.push_str("\n\n");
    }

    Ok(out.trim_end().to_string() + "\n")
}
