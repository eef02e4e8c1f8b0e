//! Task module - the persisted record of one generation request.
//!
//! - `types`: the record, its stage enum and the nested brief/outline data
//! - `progress`: stage and sub-stage progress mapping
//! - `store`: persistence behind the [`TaskStore`] trait

pub mod progress;
mod store;
pub mod types;

use std::sync::Arc;

pub use store::{validate_update, write_file_atomic, JsonTaskStore, TaskMutator, TaskStore, UpdateMode};
pub use types::{
    chapter_id, Chapter, CreativeBrief, ErrorRecord, InitialRequest, Outline,
    OutlineMetadata, Task, TaskId, TaskStatus, TaskStatusView, TaskSummary, WritingStyle,
    USER_CANCELLED,
};

/// Shared store handle used by the orchestrator and the service.
pub type SharedTaskStore = Arc<dyn TaskStore>;
