//! Task store - persists one record per generation task.
//!
//! Provides:
//! - The [`TaskStore`] trait the orchestrator depends on
//! - [`JsonTaskStore`], keeping records in memory and (optionally) as
//!   `task_<id>.json` files rewritten atomically on every update
//!
//! Updates on one task are serialised by a per-task mutex; distinct tasks
//! never contend beyond the index lookup.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};

use super::types::{InitialRequest, Task, TaskId, TaskStatus};
use crate::error::{StateError, StoreError};

/// In-place change applied to a task record by [`TaskStore::update`].
pub type TaskMutator<'a> = Box<dyn FnOnce(&mut Task) -> Result<(), StateError> + Send + 'a>;

/// Whether an update may touch a terminal task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Normal,
    /// Explicit stage retry requested by a caller.
    Retry,
}

/// Persistence boundary for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create and persist a fresh pending task.
    async fn create(&self, request: InitialRequest) -> Result<Task, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Apply `mutator` to a copy of the record, validate it, persist it, and
    /// only then make it visible. On any error the stored record is unchanged.
    async fn update(
        &self,
        id: TaskId,
        mode: UpdateMode,
        mutator: TaskMutator<'_>,
    ) -> Result<Task, StoreError>;

    /// All tasks, oldest first.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}

/// Check that `next` is a legal successor of `current`.
pub fn validate_update(current: &Task, next: &Task, mode: UpdateMode) -> Result<(), StateError> {
    if next.task_id != current.task_id || next.created_at != current.created_at {
        return Err(StateError::Invariant(
            "task identity cannot change".to_string(),
        ));
    }

    let resuming = mode == UpdateMode::Retry
        && current.status == TaskStatus::Failed
        && !next.status.is_terminal();
    if !resuming && !current.status.can_transition_to(next.status) {
        return Err(StateError::InvalidTransition {
            from: current.status,
            to: next.status,
        });
    }

    if next.run_epoch != current.run_epoch
        && (mode != UpdateMode::Retry || next.run_epoch < current.run_epoch)
    {
        return Err(StateError::Invariant(format!(
            "run epoch can only grow on retry ({} -> {})",
            current.run_epoch, next.run_epoch
        )));
    }

    let completed = next.status == TaskStatus::Completed;
    if completed == next.final_document.trim().is_empty() {
        return Err(StateError::Invariant(format!(
            "finalDocument must be non-empty exactly when completed (status {})",
            next.status
        )));
    }

    if next.progress_percentage > 100 {
        return Err(StateError::Invariant(format!(
            "progress {} out of range",
            next.progress_percentage
        )));
    }

    Ok(())
}

/// Task records held in memory, mirrored to JSON files when a directory is set.
pub struct JsonTaskStore {
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<Task>>>>,
    dir: Option<PathBuf>,
}

impl JsonTaskStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Open (or create) a store rooted at `dir`, loading every persisted record.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut tasks = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Skipping unreadable task record {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<Task>(&content) {
                Ok(task) => {
                    tasks.insert(task.task_id, Arc::new(Mutex::new(task)));
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed task record {}: {}", path.display(), e);
                }
            }
        }

        tracing::info!("Loaded {} task(s) from {}", tasks.len(), dir.display());

        Ok(Self {
            tasks: RwLock::new(tasks),
            dir: Some(dir),
        })
    }

    /// Path of the record file for `id`, if this store persists.
    pub fn record_path(&self, id: TaskId) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("task_{}.json", id)))
    }

    async fn slot(&self, id: TaskId) -> Result<Arc<Mutex<Task>>, StoreError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn persist(&self, task: &Task) -> Result<(), StoreError> {
        let Some(path) = self.record_path(task.task_id) else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(task)?;
        write_file_atomic(&path, content.as_bytes())?;
        tracing::debug!("Saved task record {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn create(&self, request: InitialRequest) -> Result<Task, StoreError> {
        let task = Task::new(request);
        self.persist(&task)?;
        self.tasks
            .write()
            .await
            .insert(task.task_id, Arc::new(Mutex::new(task.clone())));
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let slot = self.slot(id).await?;
        let task = slot.lock().await;
        Ok(task.clone())
    }

    async fn update(
        &self,
        id: TaskId,
        mode: UpdateMode,
        mutator: TaskMutator<'_>,
    ) -> Result<Task, StoreError> {
        let slot = self.slot(id).await?;
        let mut current = slot.lock().await;

        if current.status.is_terminal() && mode != UpdateMode::Retry {
            return Err(StateError::Terminal {
                id,
                status: current.status,
            }
            .into());
        }

        let mut next = current.clone();
        mutator(&mut next)?;
        next.progress_percentage = next.progress_percentage.max(current.progress_percentage);
        validate_update(&current, &next, mode)?;
        next.last_updated_timestamp = Utc::now().max(current.last_updated_timestamp);

        self.persist(&next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let slots: Vec<Arc<Mutex<Task>>> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            tasks.push(slot.lock().await.clone());
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

fn is_record_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.starts_with("task_") && name.ends_with(".json")
}

/// Write `content` to `path` via a temp file in the same directory, fsync,
/// then rename over the target.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
