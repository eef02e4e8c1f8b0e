//! Task record types.
//!
//! The persisted record mirrors the JSON shape pollers read: camelCase keys,
//! snake_case status strings, RFC 3339 timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Opaque task identifier.
pub type TaskId = Uuid;

/// Pipeline stage of a task.
///
/// The pipeline is linear:
/// `pending -> analyzing_brief -> generating_outline -> refining_outline ->
/// generating_chapters -> assembling -> completed`, and every non-terminal
/// state may jump to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    AnalyzingBrief,
    GeneratingOutline,
    RefiningOutline,
    GeneratingChapters,
    Assembling,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AnalyzingBrief => "analyzing_brief",
            Self::GeneratingOutline => "generating_outline",
            Self::RefiningOutline => "refining_outline",
            Self::GeneratingChapters => "generating_chapters",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are never left without an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The successor on the happy path.
    pub fn next(self) -> Option<TaskStatus> {
        match self {
            Self::Pending => Some(Self::AnalyzingBrief),
            Self::AnalyzingBrief => Some(Self::GeneratingOutline),
            Self::GeneratingOutline => Some(Self::RefiningOutline),
            Self::RefiningOutline => Some(Self::GeneratingChapters),
            Self::GeneratingChapters => Some(Self::Assembling),
            Self::Assembling => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Whether a record in `self` may be rewritten with status `next`.
    ///
    /// Staying in the same status is an in-stage update (refinement rounds,
    /// chapter sub-progress) and is always allowed for non-terminal states.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || self.next() == Some(next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's original input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialRequest {
    #[serde(default)]
    pub chat_history: String,
    pub request: String,
}

/// Tone, language and format constraints for the whole document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritingStyle {
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub format: String,
    #[serde(default, alias = "special_requirements", deserialize_with = "string_or_list")]
    pub special_requirements: Vec<String>,
}

/// Structured distillation of what the user wants written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeBrief {
    /// Short topic used to scope retrieval and title the document.
    #[serde(default, alias = "project_name")]
    pub project_name: String,
    #[serde(default, alias = "document_type")]
    pub document_type: String,
    #[serde(default, alias = "document_goal")]
    pub document_goal: String,
    #[serde(default, alias = "main_content_directions", deserialize_with = "string_or_list")]
    pub main_content_directions: Vec<String>,
    #[serde(default, alias = "target_audience")]
    pub target_audience: String,
    #[serde(default, alias = "writing_style")]
    pub writing_style: WritingStyle,
    #[serde(default, alias = "key_focus_areas", deserialize_with = "string_or_list")]
    pub key_focus_areas: Vec<String>,
    #[serde(default, alias = "expected_length")]
    pub expected_length: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub structure: Vec<String>,
}

impl CreativeBrief {
    /// Language the document is written in; Chinese unless the brief says otherwise.
    pub fn language(&self) -> &str {
        let language = self.writing_style.language.trim();
        if language.is_empty() {
            "中文"
        } else {
            language
        }
    }

    /// Reject briefs that carry no usable intent.
    pub fn validate(&self) -> Result<(), String> {
        if self.document_type.trim().is_empty() && self.document_goal.trim().is_empty() {
            return Err("brief has neither documentType nor documentGoal".to_string());
        }
        Ok(())
    }
}

/// One chapter of the outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub chapter_id: String,
    pub title: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Continuity summary handed to later chapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub generation_attempts: u32,
}

impl Chapter {
    pub fn new(chapter_id: String, title: String, key_points: Vec<String>) -> Self {
        Self {
            chapter_id,
            title,
            key_points,
            content: None,
            summary: None,
            generation_attempts: 0,
        }
    }

    pub fn is_generated(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// Format the id of the `seq`-th chapter (1-based).
pub fn chapter_id(seq: usize) -> String {
    format!("ch_{:02}", seq)
}

fn highest_chapter_seq(chapters: &[Chapter]) -> usize {
    chapters
        .iter()
        .filter_map(|c| c.chapter_id.strip_prefix("ch_"))
        .filter_map(|n| n.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineMetadata {
    #[serde(default)]
    pub refinement_cycles: u32,
    /// First and last chapter ids of the initial outline; refinement keeps
    /// them in place.
    #[serde(default)]
    pub pinned_chapter_ids: Vec<String>,
    /// Sequence number for the next inserted chapter. Only ever grows, so
    /// ids of removed chapters are not handed out again.
    #[serde(default)]
    pub next_chapter_seq: usize,
}

impl OutlineMetadata {
    /// Allocate a fresh chapter id, never below what `chapters` already use.
    pub fn allocate_chapter_id(&mut self, chapters: &[Chapter]) -> String {
        let seq = self
            .next_chapter_seq
            .max(highest_chapter_seq(chapters) + 1)
            .max(chapters.len() + 1);
        self.next_chapter_seq = seq + 1;
        chapter_id(seq)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub metadata: OutlineMetadata,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Outline {
    /// Build an outline from a freshly generated chapter list, pinning its endpoints.
    pub fn initial(chapters: Vec<Chapter>) -> Self {
        let mut pinned = Vec::new();
        if let Some(first) = chapters.first() {
            pinned.push(first.chapter_id.clone());
        }
        if chapters.len() > 1 {
            if let Some(last) = chapters.last() {
                pinned.push(last.chapter_id.clone());
            }
        }
        Self {
            metadata: OutlineMetadata {
                refinement_cycles: 0,
                pinned_chapter_ids: pinned,
                next_chapter_seq: highest_chapter_seq(&chapters).max(chapters.len()) + 1,
            },
            chapters,
        }
    }

    pub fn generated_count(&self) -> usize {
        self.chapters.iter().filter(|c| c.is_generated()).count()
    }

    pub fn chapter_mut(&mut self, chapter_id: &str) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| c.chapter_id == chapter_id)
    }
}

/// An entry in the task's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub stage: TaskStatus,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
}

impl ErrorRecord {
    pub fn new(stage: TaskStatus, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            stage,
            message: message.into(),
            recoverable,
            chapter_id: None,
        }
    }

    pub fn for_chapter(mut self, chapter_id: impl Into<String>) -> Self {
        self.chapter_id = Some(chapter_id.into());
        self
    }
}

/// Message recorded when a caller cancels a task.
pub const USER_CANCELLED: &str = "user-cancelled";

/// One end-to-end generation request and everything produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub current_status_message: String,
    pub initial_request: InitialRequest,
    #[serde(default)]
    pub creative_brief: Option<CreativeBrief>,
    #[serde(default)]
    pub outline: Outline,
    #[serde(default)]
    pub final_document: String,
    #[serde(default)]
    pub error_log: Vec<ErrorRecord>,
    /// Bumped on every retry. A driver only commits while the epoch it
    /// started under is current.
    #[serde(default)]
    pub run_epoch: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated_timestamp: DateTime<Utc>,
}

impl Task {
    pub fn new(initial_request: InitialRequest) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            progress_percentage: 0,
            current_status_message: "Task created, waiting to start".to_string(),
            initial_request,
            creative_brief: None,
            outline: Outline::default(),
            final_document: String::new(),
            error_log: Vec::new(),
            run_epoch: 0,
            created_at: now,
            last_updated_timestamp: now,
        }
    }

    /// Most recent error message, if any.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_log.last()
    }

    /// Stage named by the most recent unrecoverable error.
    pub fn failed_stage(&self) -> Option<TaskStatus> {
        self.error_log
            .iter()
            .rev()
            .find(|e| !e.recoverable)
            .map(|e| e.stage)
    }

    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            status: self.status,
            progress_percentage: self.progress_percentage,
            current_status_message: self.current_status_message.clone(),
            last_error: if self.status == TaskStatus::Failed {
                self.last_error().map(|e| e.message.clone())
            } else {
                None
            },
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id,
            status: self.status,
            progress_percentage: self.progress_percentage,
            request_preview: preview(&self.initial_request.request, 80),
            created_at: self.created_at,
            last_updated_timestamp: self.last_updated_timestamp,
        }
    }
}

/// What a poller sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub current_status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One row of a task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub request_preview: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_timestamp: DateTime<Utc>,
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Accept either a JSON string or a list of strings (models are inconsistent).
pub(crate) fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(items)) => items,
    })
}
