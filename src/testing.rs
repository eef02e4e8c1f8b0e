//! Test doubles shared by the module tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::PipelineSettings;
use crate::error::StoreError;
use crate::llm::{GenerationError, TextGenerator};
use crate::pipeline::prompts;
use crate::retrieval::{RetrievalError, Retriever, ScopeFilter, Snippet};
use crate::task::{InitialRequest, JsonTaskStore, Task, TaskId, TaskMutator, TaskStore, UpdateMode};

/// One recorded `complete` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub prompt: String,
    pub context: Option<String>,
}

type Responder = Box<dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync>;

/// Generator answering from a closure and logging every call.
pub struct ScriptedGenerator {
    respond: Responder,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedGenerator {
    pub fn new(respond: impl Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies in order; once exhausted every call is a content error.
    pub fn sequence<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(replies.into_iter().map(Into::into).collect());
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| GenerationError::Content("script exhausted".into()))
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose prompt starts with `task`.
    pub fn count(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.prompt.starts_with(task))
            .count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push(Call {
            prompt: prompt.to_string(),
            context: context.map(str::to_string),
        });
        tokio::task::yield_now().await;
        (self.respond)(prompt)
    }
}

/// `(chapter_id, title)` named by a chapter prompt.
pub fn chapter_line(prompt: &str) -> Option<(String, String)> {
    let line = prompt.lines().find_map(|l| l.strip_prefix("Chapter: "))?;
    let (id, title) = line.split_once(' ')?;
    Some((id.to_string(), title.to_string()))
}

/// Well-behaved replies for a whole pipeline run producing `titles`.
pub fn document_reply(prompt: &str, titles: &[&str]) -> Result<String, GenerationError> {
    if prompt.starts_with(prompts::BRIEF_TASK) {
        return Ok(serde_json::json!({
            "projectName": "一号楼",
            "documentType": "施工方案",
            "documentGoal": "指导一号楼施工",
            "mainContentDirections": ["工程概况", "施工组织", "施工进度计划"],
            "targetAudience": "项目管理人员",
            "writingStyle": {"tone": "正式", "language": "中文"},
            "keyFocusAreas": ["质量", "安全"],
        })
        .to_string());
    }
    if prompt.starts_with(prompts::OUTLINE_TASK) {
        let chapters: Vec<_> = titles
            .iter()
            .map(|t| {
                serde_json::json!({
                    "title": t,
                    "keyPoints": [format!("{}要点", t), format!("{}细节", t)],
                })
            })
            .collect();
        return Ok(serde_json::json!({ "chapters": chapters }).to_string());
    }
    if prompt.starts_with(prompts::REVIEW_TASK) {
        return Ok(r#"{"changes": []}"#.to_string());
    }
    if prompt.starts_with(prompts::ENRICH_TASK) {
        return Ok(r#"{"chapters": []}"#.to_string());
    }
    if prompt.starts_with(prompts::SUMMARY_TASK) {
        return Ok("摘要".to_string());
    }
    if let Some((_, title)) = chapter_line(prompt) {
        return Ok(format!("{}的正文。\n\n### 1. 细节\n内容", title));
    }
    Err(GenerationError::Content(format!("unexpected prompt: {}", prompt)))
}

/// Retriever returning fixed snippets and logging `(query, project)`.
pub struct StaticRetriever {
    snippets: Vec<Snippet>,
    queries: Mutex<Vec<(String, Option<String>)>>,
}

impl StaticRetriever {
    pub fn new(snippets: Vec<Snippet>) -> Self {
        Self {
            snippets,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(String, Option<String>)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        scope: Option<&ScopeFilter>,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), scope.and_then(|s| s.project.clone())));
        Ok(self.snippets.iter().take(top_k).cloned().collect())
    }
}

pub struct FailingRetriever;

#[async_trait]
impl Retriever for FailingRetriever {
    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
        _scope: Option<&ScopeFilter>,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        Err(RetrievalError::Unavailable("connection refused".into()))
    }
}

/// Store wrapper keeping every persisted snapshot, in commit order.
pub struct RecordingStore {
    inner: JsonTaskStore,
    snapshots: Mutex<HashMap<TaskId, Vec<Task>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::wrap(JsonTaskStore::in_memory())
    }

    pub fn wrap(inner: JsonTaskStore) -> Self {
        Self {
            inner,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshots(&self, id: TaskId) -> Vec<Task> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, task: &Task) {
        self.snapshots
            .lock()
            .unwrap()
            .entry(task.task_id)
            .or_default()
            .push(task.clone());
    }
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn create(&self, request: InitialRequest) -> Result<Task, StoreError> {
        let task = self.inner.create(request).await?;
        self.record(&task);
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.inner.get(id).await
    }

    async fn update(
        &self,
        id: TaskId,
        mode: UpdateMode,
        mutator: TaskMutator<'_>,
    ) -> Result<Task, StoreError> {
        let task = self.inner.update(id, mode, mutator).await?;
        self.record(&task);
        Ok(task)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list().await
    }
}

/// Default settings with millisecond backoff.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..Default::default()
    }
}
