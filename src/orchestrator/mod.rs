//! Orchestrator - drives one task through the pipeline state machine.
//!
//! ```text
//! pending -> analyzing_brief -> generating_outline -> refining_outline (xN)
//!         -> generating_chapters (per chapter) -> assembling -> completed
//!                          any live stage -> failed
//! ```
//!
//! Each step reads the persisted record, does its work, and commits the
//! result together with the next status in a single store update. `run`
//! therefore resumes any snapshot from its recorded status.
//!
//! Every commit re-checks that the task is still in the stage that started
//! the work and still on the run epoch the driver started under; a late
//! result for a cancelled or retried task is dropped.

use std::future::Future;
use std::path::PathBuf;

use futures::stream::{self, StreamExt};

use crate::config::PipelineSettings;
use crate::error::{PipelineError, StageError, StateError};
use crate::llm::{RetryConfig, SharedGenerator};
use crate::pipeline::{
    apply_changes, apply_key_point_updates, assemble, default_outline, BriefAnalyzer,
    ChapterGenerator, OutlineGap, OutlineGenerator, OutlineRefiner, RefinementRound,
};
use crate::retrieval::SharedRetriever;
use crate::task::progress::{chapter_progress, refinement_progress, stage_progress};
use crate::task::{
    write_file_atomic, CreativeBrief, ErrorRecord, Outline, SharedTaskStore, Task, TaskId,
    TaskStatus, UpdateMode, USER_CANCELLED,
};

pub struct Orchestrator {
    store: SharedTaskStore,
    brief: BriefAnalyzer,
    outline: OutlineGenerator,
    refiner: OutlineRefiner,
    chapters: ChapterGenerator,
    settings: PipelineSettings,
    export_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        store: SharedTaskStore,
        generator: SharedGenerator,
        retriever: SharedRetriever,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            brief: BriefAnalyzer::new(generator.clone()),
            outline: OutlineGenerator::new(generator.clone(), settings.max_key_points),
            refiner: OutlineRefiner::new(
                generator.clone(),
                retriever.clone(),
                settings.search_top_k,
                settings.snippet_budget_chars,
            ),
            chapters: ChapterGenerator::new(generator, retriever, settings.chapter_settings()),
            store,
            settings,
            export_dir: None,
        }
    }

    /// Directory for Markdown exports; only used when `export_markdown` is on.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    /// Drive `id` from its persisted status to a terminal one.
    ///
    /// Returns the final record. A stage that exhausts its retries marks the
    /// task failed and is returned as [`PipelineError::Fatal`]; any other
    /// error also marks it failed before being returned. When the task is
    /// retried while this call is in flight, the call stops committing and
    /// returns the record as it finds it.
    pub async fn run(&self, id: TaskId) -> Result<Task, PipelineError> {
        let mut started_epoch = None;
        loop {
            let task = self.store.get(id).await?;
            let run = Run {
                id,
                epoch: *started_epoch.get_or_insert(task.run_epoch),
            };
            if task.run_epoch != run.epoch {
                tracing::info!(
                    "Task {} restarted as run {}; run {} stops here",
                    id,
                    task.run_epoch,
                    run.epoch
                );
                return Ok(task);
            }
            if task.status.is_terminal() {
                tracing::info!("Task {} finished as {}", id, task.status);
                return Ok(task);
            }

            tracing::debug!("Task {} step: {}", id, task.status);
            let step = match task.status {
                TaskStatus::Pending => self.start(run).await,
                TaskStatus::AnalyzingBrief => self.analyze_brief(run, &task).await,
                TaskStatus::GeneratingOutline => self.generate_outline(run, &task).await,
                TaskStatus::RefiningOutline => self.refine_outline(run, &task).await,
                TaskStatus::GeneratingChapters => self.generate_chapters(run, &task).await,
                TaskStatus::Assembling => self.assemble(run, &task).await,
                TaskStatus::Completed | TaskStatus::Failed => continue,
            };

            if let Err(err) = step {
                return self.settle(run, task.status, err).await;
            }
        }
    }

    /// Record a step failure on the task. Results of a superseded run, and
    /// stale results for a task that already finished, are dropped instead.
    async fn settle(
        &self,
        run: Run,
        step: TaskStatus,
        err: PipelineError,
    ) -> Result<Task, PipelineError> {
        let current = match self.store.get(run.id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!(
                    "Task {} failed in {} and could not be reloaded: {} ({})",
                    run.id,
                    step,
                    err,
                    e
                );
                return Err(err);
            }
        };
        if current.run_epoch != run.epoch {
            tracing::info!("Task {} was restarted during {}; dropping result", run.id, step);
            return Ok(current);
        }
        if err.as_state_error().is_some() && current.status.is_terminal() {
            tracing::info!(
                "Task {} became {} during {}; dropping result",
                run.id,
                current.status,
                step
            );
            return Ok(current);
        }

        let (stage, message, chapter_id) = match &err {
            PipelineError::Fatal {
                stage,
                attempts,
                source,
                chapter_id,
            } => {
                tracing::error!(
                    "Task {} failed in {} after {} attempt(s): {}",
                    run.id,
                    stage,
                    attempts,
                    source
                );
                let message = match chapter_id {
                    Some(chapter) => format!("chapter {} failed: {}", chapter, source),
                    None => source.to_string(),
                };
                (*stage, message, chapter_id.clone())
            }
            other => {
                tracing::error!("Task {} hit an error in {}: {}", run.id, step, other);
                (current.status, other.to_string(), None)
            }
        };
        if let Err(e) = self.fail(run, stage, message, chapter_id).await {
            tracing::error!("Task {} could not be marked failed: {}", run.id, e);
        }
        Err(err)
    }

    /// Cancel a live task: it becomes failed with a `user-cancelled` record.
    pub async fn cancel(&self, id: TaskId) -> Result<Task, PipelineError> {
        let task = self
            .store
            .update(
                id,
                UpdateMode::Normal,
                Box::new(|t| {
                    t.error_log.push(ErrorRecord::new(t.status, USER_CANCELLED, false));
                    t.status = TaskStatus::Failed;
                    t.current_status_message = "Cancelled by user".to_string();
                    Ok(())
                }),
            )
            .await?;
        tracing::info!("Task {} cancelled", id);
        Ok(task)
    }

    /// Move a failed task back to the stage that failed. Content produced
    /// before the failure is kept.
    pub async fn prepare_retry(&self, id: TaskId) -> Result<Task, PipelineError> {
        let task = self
            .store
            .update(
                id,
                UpdateMode::Retry,
                Box::new(move |t| {
                    if t.status != TaskStatus::Failed {
                        return Err(StateError::NothingToRetry {
                            id,
                            status: t.status,
                        });
                    }
                    let stage = t
                        .failed_stage()
                        .filter(|s| !s.is_terminal())
                        .unwrap_or(TaskStatus::Pending);
                    t.error_log
                        .push(ErrorRecord::new(stage, "stage retry requested", true));
                    t.status = stage;
                    t.run_epoch += 1;
                    t.current_status_message = format!("Retrying from {}", stage);
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(
            "Task {} will retry from {} as run {}",
            id,
            task.status,
            task.run_epoch
        );
        Ok(task)
    }

    // ─── Steps ──────────────────────────────────────────────────────────

    async fn start(&self, run: Run) -> Result<(), PipelineError> {
        self.advance(run, TaskStatus::Pending, "Analyzing request", |_| {})
            .await
    }

    async fn analyze_brief(&self, run: Run, task: &Task) -> Result<(), PipelineError> {
        let stage = TaskStatus::AnalyzingBrief;
        let brief = self
            .attempt(run, stage, &self.settings.stage_retry(), || {
                self.brief.analyze(&task.initial_request)
            })
            .await?;

        tracing::info!(
            "Task {} brief ready: {} ({})",
            run.id,
            brief.document_type,
            brief.project_name
        );
        self.advance(run, stage, "Generating outline", move |t| {
            t.creative_brief = Some(brief);
        })
        .await
    }

    async fn generate_outline(&self, run: Run, task: &Task) -> Result<(), PipelineError> {
        let stage = TaskStatus::GeneratingOutline;
        let brief = required_brief(task)?;

        let mut fallback_record = None;
        let outline = match self
            .attempt(run, stage, &self.settings.stage_retry(), || {
                self.outline.generate(brief)
            })
            .await
        {
            Ok(outline) => outline,
            Err(PipelineError::Fatal {
                source: StageError::Content(message),
                ..
            }) if self.settings.outline_fallback => {
                tracing::warn!("Task {} using default outline: {}", run.id, message);
                fallback_record = Some(ErrorRecord::new(
                    stage,
                    format!("outline generation failed, using default outline: {}", message),
                    true,
                ));
                default_outline(brief, self.settings.max_key_points)
            }
            Err(e) => return Err(e),
        };

        tracing::info!("Task {} outline has {} chapter(s)", run.id, outline.chapters.len());
        self.advance(run, stage, "Refining outline", move |t| {
            t.outline = outline;
            t.error_log.extend(fallback_record);
        })
        .await
    }

    /// One review round per call; the loop in `run` comes back until the
    /// status moves on.
    async fn refine_outline(&self, run: Run, task: &Task) -> Result<(), PipelineError> {
        let stage = TaskStatus::RefiningOutline;
        let max = self.settings.max_refinement_cycles;
        let cycles = task.outline.metadata.refinement_cycles;
        if cycles >= max {
            return self.advance(run, stage, "Outline finalized", |_| {}).await;
        }

        let brief = required_brief(task)?;
        let review = match self
            .attempt(run, stage, &self.settings.stage_retry(), || {
                self.refiner.review(brief, &task.outline)
            })
            .await
        {
            Ok(review) => review,
            Err(PipelineError::Fatal {
                source: StageError::Content(message),
                ..
            }) => {
                tracing::warn!(
                    "Task {} outline review unusable, keeping outline: {}",
                    run.id,
                    message
                );
                let record = ErrorRecord::new(
                    stage,
                    format!("outline review unusable, keeping current outline: {}", message),
                    true,
                );
                return self
                    .advance(run, stage, "Outline finalized", move |t| {
                        t.error_log.push(record);
                    })
                    .await;
            }
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        let mut round = apply_changes(&task.outline, &review.changes, self.settings.max_key_points);
        let enriched = if review.gaps.is_empty() {
            0
        } else {
            self.fill_gaps(run, brief, task, &review.gaps, &mut round, &mut records)
                .await?
        };

        let cycle = cycles + 1;
        let finished = round.applied + enriched == 0 || cycle >= max;
        tracing::info!(
            "Task {} refinement round {}/{}: {} change(s), {} chapter(s) enriched",
            run.id,
            cycle,
            max,
            round.applied,
            enriched
        );

        let apply = move |t: &mut Task| {
            t.outline.chapters = round.chapters;
            t.outline.metadata.next_chapter_seq = round.next_chapter_seq;
            t.outline.metadata.refinement_cycles = cycle;
            t.error_log.extend(records);
            t.progress_percentage = refinement_progress(cycle, max);
            t.current_status_message = format!(
                "Refinement round {}/{}: {} change(s), {} chapter(s) enriched",
                cycle, max, round.applied, enriched
            );
        };
        if finished {
            self.advance(run, stage, "Outline finalized", apply).await
        } else {
            self.commit(run, stage, apply).await.map(|_| ())
        }
    }

    /// Look up the review's gap keywords and fold what was found into the
    /// round's key points. Returns the number of chapters changed.
    async fn fill_gaps(
        &self,
        run: Run,
        brief: &CreativeBrief,
        task: &Task,
        gaps: &[OutlineGap],
        round: &mut RefinementRound,
        records: &mut Vec<ErrorRecord>,
    ) -> Result<usize, PipelineError> {
        let stage = TaskStatus::RefiningOutline;
        let research = self.refiner.research(brief, gaps).await;
        if let Some(error) = &research.retrieval_error {
            records.push(ErrorRecord::new(
                stage,
                format!("gap search unavailable: {}", error),
                true,
            ));
        }
        if research.material.is_empty() {
            tracing::debug!(
                "Task {} gap search found nothing for {} query(ies)",
                run.id,
                research.queries.len()
            );
            return Ok(0);
        }

        let revised = Outline {
            metadata: task.outline.metadata.clone(),
            chapters: round.chapters.clone(),
        };
        let updates = match self
            .attempt(run, stage, &self.settings.stage_retry(), || {
                self.refiner.enrich(brief, &revised, gaps, &research.material)
            })
            .await
        {
            Ok(updates) => updates,
            Err(PipelineError::Fatal {
                source: StageError::Content(message),
                ..
            }) => {
                tracing::warn!("Task {} outline enrichment unusable: {}", run.id, message);
                records.push(ErrorRecord::new(
                    stage,
                    format!("outline enrichment unusable, key points unchanged: {}", message),
                    true,
                ));
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        Ok(apply_key_point_updates(
            &mut round.chapters,
            &updates,
            self.settings.max_key_points,
        ))
    }

    async fn generate_chapters(&self, run: Run, task: &Task) -> Result<(), PipelineError> {
        let stage = TaskStatus::GeneratingChapters;
        let brief = required_brief(task)?;
        let pending: Vec<String> = task
            .outline
            .chapters
            .iter()
            .filter(|c| !c.is_generated())
            .map(|c| c.chapter_id.clone())
            .collect();

        let concurrency = self.settings.chapter_concurrency.max(1);
        if concurrency == 1 {
            for chapter_id in &pending {
                self.generate_chapter(run, brief, chapter_id).await?;
            }
        } else {
            let mut results = stream::iter(pending)
                .map(|chapter_id| async move {
                    self.generate_chapter(run, brief, &chapter_id).await
                })
                .buffered(concurrency);
            while let Some(result) = results.next().await {
                result?;
            }
        }

        self.advance(run, stage, "Assembling document", |_| {}).await
    }

    async fn generate_chapter(
        &self,
        run: Run,
        brief: &CreativeBrief,
        chapter_id: &str,
    ) -> Result<(), PipelineError> {
        let stage = TaskStatus::GeneratingChapters;
        let retry = self.settings.chapter_retry();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let owned_id = chapter_id.to_string();
            let task = self
                .commit(run, stage, move |t| {
                    let total = t.outline.chapters.len();
                    let position = t
                        .outline
                        .chapters
                        .iter()
                        .position(|c| c.chapter_id == owned_id);
                    if let Some(index) = position {
                        let chapter = &mut t.outline.chapters[index];
                        chapter.generation_attempts += 1;
                        t.current_status_message = format!(
                            "Generating chapter {}/{}: {}",
                            index + 1,
                            total,
                            chapter.title
                        );
                    }
                })
                .await?;

            match self.chapters.generate(brief, &task.outline, chapter_id).await {
                Ok(draft) => {
                    tracing::info!(
                        "Task {} chapter {} written ({} chars, {} snippet(s))",
                        run.id,
                        chapter_id,
                        draft.content.chars().count(),
                        draft.grounded_snippets
                    );
                    let owned_id = chapter_id.to_string();
                    self.store
                        .update(
                            run.id,
                            UpdateMode::Normal,
                            Box::new(move |t| {
                                ensure_stage(run, t, stage)?;
                                let chapter = t.outline.chapter_mut(&owned_id).ok_or_else(|| {
                                    StateError::Invariant(format!(
                                        "chapter {} vanished from outline",
                                        owned_id
                                    ))
                                })?;
                                chapter.content = Some(draft.content);
                                chapter.summary = Some(draft.summary);
                                let title = chapter.title.clone();
                                if let Some(error) = draft.retrieval_error {
                                    t.error_log.push(
                                        ErrorRecord::new(
                                            stage,
                                            format!("retrieval unavailable, written ungrounded: {}", error),
                                            true,
                                        )
                                        .for_chapter(owned_id.clone()),
                                    );
                                }
                                let done = t.outline.generated_count();
                                let total = t.outline.chapters.len();
                                t.progress_percentage = chapter_progress(done, total);
                                t.current_status_message =
                                    format!("Chapter {}/{} done: {}", done, total, title);
                                Ok(())
                            }),
                        )
                        .await?;
                    return Ok(());
                }
                Err(error) => {
                    if attempt >= retry.max_attempts {
                        return Err(PipelineError::Fatal {
                            stage,
                            attempts: attempt,
                            source: error,
                            chapter_id: Some(chapter_id.to_string()),
                        });
                    }
                    self.backoff(run, stage, Some(chapter_id), attempt, &retry, &error)
                        .await?;
                }
            }
        }
    }

    async fn assemble(&self, run: Run, task: &Task) -> Result<(), PipelineError> {
        let stage = TaskStatus::Assembling;
        let title = task
            .creative_brief
            .as_ref()
            .map(|b| b.project_name.as_str())
            .unwrap_or_default();
        let document = assemble(title, &task.outline.chapters)
            .map_err(|e| PipelineError::fatal(stage, 1, e))?;

        let export = document.clone();
        self.advance(run, stage, "Document completed", move |t| {
            t.final_document = document;
        })
        .await?;

        if self.settings.export_markdown {
            self.export(run.id, &export);
        }
        Ok(())
    }

    fn export(&self, id: TaskId, document: &str) {
        let Some(dir) = &self.export_dir else {
            tracing::warn!("Markdown export enabled but no export directory configured");
            return;
        };
        let path = dir.join(format!("{}.md", id));
        match write_file_atomic(&path, document.as_bytes()) {
            Ok(()) => tracing::info!("Task {} exported to {}", id, path.display()),
            Err(e) => tracing::warn!("Task {} export to {} failed: {}", id, path.display(), e),
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    /// Run `op` with backoff on transient errors. Content errors are final
    /// here: stages already made their corrective retry.
    async fn attempt<T, F, Fut>(
        &self,
        run: Run,
        stage: TaskStatus,
        retry: &RetryConfig,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < retry.max_attempts => {
                    self.backoff(run, stage, None, attempt, retry, &error).await?;
                }
                Err(error) => return Err(PipelineError::fatal(stage, attempt, error)),
            }
        }
    }

    /// Log a recoverable failure and sleep before the next attempt.
    async fn backoff(
        &self,
        run: Run,
        stage: TaskStatus,
        chapter_id: Option<&str>,
        attempt: u32,
        retry: &RetryConfig,
        error: &StageError,
    ) -> Result<(), PipelineError> {
        let delay = retry.delay_with_hint(attempt, error.retry_after());
        tracing::warn!(
            "Task {} {} attempt {}/{} failed, retrying in {:?}: {}",
            run.id,
            stage,
            attempt,
            retry.max_attempts,
            delay,
            error
        );

        let mut record = ErrorRecord::new(
            stage,
            format!(
                "attempt {}/{} failed, retrying: {}",
                attempt, retry.max_attempts, error
            ),
            true,
        );
        if let Some(chapter_id) = chapter_id {
            record = record.for_chapter(chapter_id);
        }
        self.commit(run, stage, move |t| t.error_log.push(record))
            .await?;

        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// In-stage update guarded against stale and superseded results.
    async fn commit<F>(&self, run: Run, expected: TaskStatus, apply: F) -> Result<Task, PipelineError>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        let task = self
            .store
            .update(
                run.id,
                UpdateMode::Normal,
                Box::new(move |t| {
                    ensure_stage(run, t, expected)?;
                    apply(t);
                    Ok(())
                }),
            )
            .await?;
        Ok(task)
    }

    /// Apply `apply` and move from `from` to its successor in one update.
    async fn advance<F>(
        &self,
        run: Run,
        from: TaskStatus,
        message: &str,
        apply: F,
    ) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        let Some(next) = from.next() else {
            return Err(StateError::InvalidTransition {
                from,
                to: TaskStatus::Failed,
            }
            .into());
        };
        let message = message.to_string();
        let task = self
            .commit(run, from, move |t| {
                apply(t);
                t.status = next;
                if let Some(progress) = stage_progress(next) {
                    t.progress_percentage = progress;
                }
                t.current_status_message = message;
            })
            .await?;
        tracing::info!("Task {} -> {} ({}%)", run.id, task.status, task.progress_percentage);
        Ok(())
    }

    /// Mark the task failed, keeping everything produced so far. A task that
    /// is already terminal, or was restarted, is left alone.
    async fn fail(
        &self,
        run: Run,
        stage: TaskStatus,
        message: String,
        chapter_id: Option<String>,
    ) -> Result<(), PipelineError> {
        let id = run.id;
        let result = self
            .store
            .update(
                id,
                UpdateMode::Normal,
                Box::new(move |t| {
                    ensure_epoch(run, t)?;
                    let mut record = ErrorRecord::new(stage, message.clone(), false);
                    record.chapter_id = chapter_id;
                    t.error_log.push(record);
                    t.status = TaskStatus::Failed;
                    t.current_status_message = format!("Failed during {}: {}", stage, message);
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = PipelineError::from(e);
                match err.as_state_error() {
                    Some(StateError::Terminal { .. }) => {
                        tracing::info!("Task {} already terminal; failure not recorded", id);
                        Ok(())
                    }
                    Some(StateError::Superseded { .. }) => {
                        tracing::info!("Task {} was restarted; failure not recorded", id);
                        Ok(())
                    }
                    _ => Err(err),
                }
            }
        }
    }
}

/// The task a driver works on and the retry epoch it started under.
#[derive(Debug, Clone, Copy)]
struct Run {
    id: TaskId,
    epoch: u32,
}

fn ensure_epoch(run: Run, task: &Task) -> Result<(), StateError> {
    if task.run_epoch != run.epoch {
        return Err(StateError::Superseded {
            id: run.id,
            run: run.epoch,
            current: task.run_epoch,
        });
    }
    Ok(())
}

fn ensure_stage(run: Run, task: &Task, expected: TaskStatus) -> Result<(), StateError> {
    ensure_epoch(run, task)?;
    if task.status != expected {
        return Err(StateError::Stale {
            id: run.id,
            expected,
            found: task.status,
        });
    }
    Ok(())
}

fn required_brief(task: &Task) -> Result<&CreativeBrief, StateError> {
    task.creative_brief.as_ref().ok_or_else(|| {
        StateError::Invariant(format!("task {} has no creative brief at {}", task.task_id, task.status))
    })
}

#[cfg(test)]
mod tests;
