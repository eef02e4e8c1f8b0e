//! Error taxonomy for the pipeline.
//!
//! - [`StageError`]: what a single stage attempt returns (transient or content).
//! - [`StateError`]: operation invalid for the task's current status; never retried.
//! - [`StoreError`]: task store failures, wrapping state errors raised by updates.
//! - [`PipelineError`]: what the orchestrator surfaces; `Fatal` means a stage
//!   exhausted its retry budget.

use std::time::Duration;

use thiserror::Error;

use crate::llm::GenerationError;
use crate::task::{TaskId, TaskStatus};

/// Failure of one attempt at a pipeline stage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    /// Network, rate limit or upstream outage; worth retrying with backoff.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Collaborator output could not be used, even after a corrective prompt.
    #[error("unusable output: {0}")]
    Content(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Content(_) => None,
        }
    }
}

impl From<GenerationError> for StageError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Transient {
                message,
                retry_after,
            } => Self::Transient {
                message,
                retry_after,
            },
            GenerationError::Content(message) => Self::Content(message),
        }
    }
}

/// An operation that is not valid for the task's current status.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("task {id} is {status}; updates require an explicit retry")]
    Terminal { id: TaskId, status: TaskStatus },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("stale result for task {id}: expected {expected}, task is {found}")]
    Stale {
        id: TaskId,
        expected: TaskStatus,
        found: TaskStatus,
    },

    #[error("task {id} was restarted (run {run}, now {current}); result dropped")]
    Superseded { id: TaskId, run: u32, current: u32 },

    #[error("task {id} has no result while {status}")]
    NotCompleted { id: TaskId, status: TaskStatus },

    #[error("task {id} is {status}; only failed tasks can be retried")]
    NothingToRetry { id: TaskId, status: TaskStatus },

    #[error("task record invariant violated: {0}")]
    Invariant(String),
}

/// Task store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("task storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("task record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error surfaced by the orchestrator and the service facade.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Retry budget exhausted; the task has been (or will be) marked failed.
    #[error("{stage} failed after {attempts} attempt(s): {source}")]
    Fatal {
        stage: TaskStatus,
        attempts: u32,
        source: StageError,
        chapter_id: Option<String>,
    },
}

impl PipelineError {
    pub fn fatal(stage: TaskStatus, attempts: u32, source: StageError) -> Self {
        Self::Fatal {
            stage,
            attempts,
            source,
            chapter_id: None,
        }
    }

    /// The state error behind this failure, if that is what it is.
    pub fn as_state_error(&self) -> Option<&StateError> {
        match self {
            Self::Store(StoreError::State(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound(_)))
    }
}

impl From<StateError> for PipelineError {
    fn from(err: StateError) -> Self {
        Self::Store(StoreError::State(err))
    }
}
