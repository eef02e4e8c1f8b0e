//! Document service - the exposed task API.
//!
//! Each task is driven by its own spawned future, so polling one task never
//! waits on another task's in-flight model call. A retry replaces the task's
//! driver; the old one is aborted and anything it still tries to commit is
//! rejected by the run epoch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::Config;
use crate::error::{PipelineError, StateError};
use crate::llm::{ChatGenerator, ChatOptions, OpenAiCompatClient};
use crate::orchestrator::Orchestrator;
use crate::retrieval::{HttpRetriever, NoopRetriever, SharedRetriever};
use crate::task::{
    InitialRequest, JsonTaskStore, SharedTaskStore, Task, TaskId, TaskStatus, TaskStatusView,
    TaskSummary,
};

pub struct DocumentService {
    orchestrator: Arc<Orchestrator>,
    running: Mutex<HashMap<TaskId, Driver>>,
}

/// A spawned driver. `finished` flips to true when it returns; an abort
/// closes the channel instead.
struct Driver {
    handle: JoinHandle<()>,
    finished: watch::Receiver<bool>,
}

impl Driver {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub type SharedDocumentService = Arc<DocumentService>;

impl DocumentService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the production collaborators described by `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config
            .llm_api_key
            .clone()
            .context("no API key configured; set LONGDOC_LLM_API_KEY or DEEPSEEK_API_KEY")?;

        let store = JsonTaskStore::open(config.tasks_dir())
            .await
            .with_context(|| format!("failed to open task store at {}", config.tasks_dir().display()))?;

        let client = Arc::new(OpenAiCompatClient::new(config.llm_base_url.clone(), api_key));
        let options = ChatOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            ..Default::default()
        };
        let generator = ChatGenerator::new(client, config.model.clone(), options);

        let retriever: SharedRetriever = match &config.retrieval_url {
            Some(url) => {
                tracing::info!("Retrieval enabled: {}", url);
                Arc::new(HttpRetriever::new(url.clone()))
            }
            None => {
                tracing::info!("No LONGDOC_RETRIEVAL_URL set; chapters will be ungrounded");
                Arc::new(NoopRetriever)
            }
        };

        let orchestrator = Orchestrator::new(
            Arc::new(store),
            Arc::new(generator),
            retriever,
            config.pipeline.clone(),
        )
        .with_export_dir(config.documents_dir());

        tracing::info!(
            "Document service ready: model={} data_dir={}",
            config.model,
            config.data_dir.display()
        );
        Ok(Self::new(orchestrator))
    }

    pub fn store(&self) -> &SharedTaskStore {
        self.orchestrator.store()
    }

    /// Persist a new pending task and start driving it.
    pub async fn create_task(
        &self,
        chat_history: impl Into<String>,
        request: impl Into<String>,
    ) -> Result<TaskId, PipelineError> {
        let task = self
            .store()
            .create(InitialRequest {
                chat_history: chat_history.into(),
                request: request.into(),
            })
            .await?;
        tracing::info!("Created task {}", task.task_id);
        self.spawn(task.task_id).await;
        Ok(task.task_id)
    }

    pub async fn get_task_status(&self, id: TaskId) -> Result<TaskStatusView, PipelineError> {
        Ok(self.store().get(id).await?.status_view())
    }

    /// The final document; only defined once the task has completed.
    pub async fn get_task_result(&self, id: TaskId) -> Result<String, PipelineError> {
        let task = self.store().get(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(StateError::NotCompleted {
                id,
                status: task.status,
            }
            .into());
        }
        Ok(task.final_document)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, PipelineError> {
        Ok(self.store().get(id).await?)
    }

    /// Every task, newest first.
    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>, PipelineError> {
        let tasks = self.store().list().await?;
        Ok(tasks.iter().rev().map(Task::summary).collect())
    }

    /// Mark a live task failed. An in-flight call is left to finish and its
    /// result is discarded.
    pub async fn cancel_task(&self, id: TaskId) -> Result<TaskStatusView, PipelineError> {
        let task = self.orchestrator.cancel(id).await?;
        Ok(task.status_view())
    }

    /// Restart a failed task from the stage that failed. A driver still
    /// running for it is aborted.
    pub async fn retry_task(&self, id: TaskId) -> Result<TaskStatusView, PipelineError> {
        let mut running = self.running.lock().await;

        let task = self.orchestrator.prepare_retry(id).await?;
        if let Some(old) = running.remove(&id) {
            if !old.is_finished() {
                tracing::info!("Stopping superseded driver for task {}", id);
                old.handle.abort();
            }
        }
        running.insert(id, self.driver(id));
        Ok(task.status_view())
    }

    /// Start drivers for every persisted task that has not finished.
    pub async fn resume_incomplete(&self) -> Result<Vec<TaskId>, PipelineError> {
        let tasks = self.store().list().await?;
        let mut resumed = Vec::new();
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            if self.spawn(task.task_id).await {
                tracing::info!("Resuming task {} from {}", task.task_id, task.status);
                resumed.push(task.task_id);
            }
        }
        Ok(resumed)
    }

    /// Wait until the task has no live driver, then return the record.
    /// Follows the task across retries that replace its driver meanwhile.
    pub async fn wait(&self, id: TaskId) -> Result<Task, PipelineError> {
        loop {
            let finished = self
                .running
                .lock()
                .await
                .get(&id)
                .map(|driver| driver.finished.clone());
            if let Some(mut finished) = finished {
                if finished.wait_for(|done| *done).await.is_err() {
                    tracing::debug!("Driver for task {} was aborted", id);
                }
            }

            let task = self.get_task(id).await?;
            let live = self
                .running
                .lock()
                .await
                .get(&id)
                .is_some_and(|driver| !driver.is_finished());
            if task.status.is_terminal() || !live {
                return Ok(task);
            }
        }
    }

    /// Spawn a driver unless one is already running. Returns whether it spawned.
    async fn spawn(&self, id: TaskId) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, driver| !driver.is_finished());
        if running.contains_key(&id) {
            return false;
        }
        running.insert(id, self.driver(id));
        true
    }

    fn driver(&self, id: TaskId) -> Driver {
        let orchestrator = Arc::clone(&self.orchestrator);
        let (done, finished) = watch::channel(false);
        let span = tracing::info_span!("task", task_id = %id);
        let handle = tokio::spawn(
            async move {
                match orchestrator.run(id).await {
                    Ok(task) => tracing::info!("Driver finished: {}", task.status),
                    Err(e) => tracing::warn!("Driver stopped: {}", e),
                }
                done.send_replace(true);
            }
            .instrument(span),
        );
        Driver { handle, finished }
    }
}
