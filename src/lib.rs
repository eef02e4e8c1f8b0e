//! # longdoc
//!
//! Resumable long-document generation.
//!
//! A user request (plus optional chat history) becomes a creative brief, an
//! outline that is reviewed for a bounded number of rounds, chapters written
//! one at a time with retrieved reference material, and finally a single
//! markdown document.
//!
//! ## Architecture
//!
//! ```text
//!   DocumentService  (create / status / result / cancel / retry)
//!         │ spawns one driver per task
//!         ▼
//!   ┌──────────────┐   read/update   ┌─────────────┐
//!   │ Orchestrator │ ──────────────▶ │  TaskStore  │ tasks/task_<id>.json
//!   └──────┬───────┘                 └─────────────┘
//!          │ stages
//!          ├── BriefAnalyzer ─────┐
//!          ├── OutlineGenerator ──┤
//!          ├── OutlineRefiner ────┼──▶ TextGenerator (LLM)
//!          ├── ChapterGenerator ──┘
//!          │        └────────────────▶ Retriever (reference search)
//!          └── assemble
//! ```
//!
//! Every stage commits its result to the task record before the next stage
//! starts, so a restarted process resumes from the last persisted status.
//!
//! ## Modules
//! - `task`: task record, status machine, progress and the task store
//! - `pipeline`: the stage collaborators and prompt construction
//! - `orchestrator`: drives one task through the stages
//! - `service`: the task API used by the binary
//! - `llm`: OpenAI-compatible chat client and error classification
//! - `retrieval`: reference search client and context packing

pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod retrieval;
pub mod service;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::{Config, PipelineSettings};
pub use error::{PipelineError, StageError, StateError, StoreError};
pub use orchestrator::Orchestrator;
pub use service::{DocumentService, SharedDocumentService};
pub use task::{Task, TaskId, TaskStatus, TaskStatusView, TaskSummary};
