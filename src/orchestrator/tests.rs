use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::Notify;

use super::*;
use crate::error::StoreError;
use crate::llm::{GenerationError, TextGenerator};
use crate::pipeline::prompts;
use crate::retrieval::{NoopRetriever, Snippet};
use crate::task::{chapter_id, Chapter, InitialRequest, JsonTaskStore, TaskMutator, TaskStore};
use crate::testing::{
    chapter_line, document_reply, fast_settings, FailingRetriever, RecordingStore,
    ScriptedGenerator, StaticRetriever,
};

const TITLES: [&str; 3] = ["概述", "主要内容", "总结与展望"];
const SCENARIO: &str = "生成一号楼施工方案，包括工程概况、施工组织、施工进度计划、主要施工方法、质量保证措施、安全文明施工等内容";

struct Harness {
    store: Arc<RecordingStore>,
    generator: Arc<ScriptedGenerator>,
    orchestrator: Orchestrator,
}

fn harness(generator: ScriptedGenerator, retriever: SharedRetriever, settings: PipelineSettings) -> Harness {
    let store = Arc::new(RecordingStore::new());
    let generator = Arc::new(generator);
    let orchestrator = Orchestrator::new(store.clone(), generator.clone(), retriever, settings);
    Harness {
        store,
        generator,
        orchestrator,
    }
}

fn happy_generator() -> ScriptedGenerator {
    ScriptedGenerator::new(|p| document_reply(p, &TITLES))
}

async fn create(store: &dyn TaskStore) -> TaskId {
    store
        .create(InitialRequest {
            chat_history: String::new(),
            request: SCENARIO.to_string(),
        })
        .await
        .unwrap()
        .task_id
}

/// Titles of the top-level `## n. Title` sections, in order.
fn section_titles(document: &str) -> Vec<String> {
    document
        .lines()
        .filter_map(|l| l.strip_prefix("## "))
        .filter_map(|l| l.split_once(". ").map(|(_, title)| title.to_string()))
        .collect()
}

fn assert_snapshot_properties(snapshots: &[Task], max_cycles: u32) {
    assert!(!snapshots.is_empty());
    let pinned = snapshots
        .iter()
        .find(|s| !s.outline.metadata.pinned_chapter_ids.is_empty())
        .map(|s| s.outline.metadata.pinned_chapter_ids.clone());

    for pair in snapshots.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        assert!(
            after.progress_percentage >= before.progress_percentage,
            "progress regressed {} -> {}",
            before.progress_percentage,
            after.progress_percentage
        );
        assert!(
            before.status.can_transition_to(after.status)
                || (before.status == TaskStatus::Failed && !after.status.is_terminal()),
            "illegal transition {} -> {}",
            before.status,
            after.status
        );
        assert!(after.last_updated_timestamp >= before.last_updated_timestamp);
    }

    for snapshot in snapshots {
        assert_eq!(
            snapshot.status == TaskStatus::Completed,
            !snapshot.final_document.is_empty()
        );
        assert!(snapshot.outline.metadata.refinement_cycles <= max_cycles);
        if let (Some(pinned), Some(first), Some(last)) = (
            pinned.as_ref(),
            snapshot.outline.chapters.first(),
            snapshot.outline.chapters.last(),
        ) {
            assert_eq!(&first.chapter_id, &pinned[0]);
            assert_eq!(&last.chapter_id, pinned.last().unwrap());
        }
    }
}

#[tokio::test]
async fn test_construction_plan_scenario() {
    let h = harness(happy_generator(), Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percentage, 100);
    assert!(task.final_document.starts_with("# 一号楼\n"));
    assert_eq!(section_titles(&task.final_document), TITLES);
    assert!(task.final_document.contains("### 1. 细节"));
    assert!(task.outline.chapters.iter().all(|c| c.is_generated()));
    assert!(task.outline.chapters.iter().all(|c| c.generation_attempts == 1));
    assert!(task.error_log.is_empty());

    // A clean review ends refinement after one round.
    assert_eq!(task.outline.metadata.refinement_cycles, 1);
    assert_eq!(h.generator.count(prompts::REVIEW_TASK), 1);
    assert_eq!(h.generator.count(prompts::CHAPTER_TASK), 3);

    assert_snapshot_properties(&h.store.snapshots(id), 3);
    let statuses: Vec<_> = h.store.snapshots(id).iter().map(|s| s.status).collect();
    assert!(statuses.contains(&TaskStatus::RefiningOutline));
    assert_eq!(statuses.last(), Some(&TaskStatus::Completed));
}

#[tokio::test]
async fn test_refinement_is_bounded_and_keeps_endpoints() {
    let generator = ScriptedGenerator::new(|p| {
        if p.starts_with(prompts::REVIEW_TASK) {
            return Ok(r#"{"changes": [
                {"action": "remove", "chapterId": "ch_01"},
                {"action": "remove", "chapterId": "ch_03"},
                {"action": "move", "chapterId": "ch_03", "after": "ch_01"},
                {"action": "insert", "after": "ch_01", "title": "施工组织", "keyPoints": ["人员", "机械"]}
            ]}"#
            .to_string());
        }
        document_reply(p, &TITLES)
    });
    let settings = PipelineSettings {
        max_refinement_cycles: 2,
        ..fast_settings()
    };
    let h = harness(generator, Arc::new(NoopRetriever), settings);
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.outline.metadata.refinement_cycles, 2);
    assert_eq!(h.generator.count(prompts::REVIEW_TASK), 2);
    let ids: Vec<_> = task.outline.chapters.iter().map(|c| c.chapter_id.as_str()).collect();
    assert_eq!(ids, vec!["ch_01", "ch_05", "ch_04", "ch_02", "ch_03"]);
    assert_eq!(
        section_titles(&task.final_document),
        vec!["概述", "施工组织", "施工组织", "主要内容", "总结与展望"]
    );
    assert_snapshot_properties(&h.store.snapshots(id), 2);
}

#[tokio::test]
async fn test_refinement_fills_gaps_from_project_search() {
    let generator = ScriptedGenerator::new(|p| {
        if p.starts_with(prompts::REVIEW_TASK) {
            return Ok(r#"{"changes": [], "gaps_identified": [
                {"chapterId": "ch_02", "title": "主要内容", "queryKeywords": ["塔吊", "基坑"]}
            ]}"#
            .to_string());
        }
        if p.starts_with(prompts::ENRICH_TASK) {
            return Ok(r#"{"chapters": [
                {"chapterId": "ch_02", "keyPoints": ["塔吊布置在北侧", "基坑深度六米"]}
            ]}"#
            .to_string());
        }
        document_reply(p, &TITLES)
    });
    let retriever = Arc::new(StaticRetriever::new(vec![Snippet::new("塔吊布置在北侧", 0.9)]));
    let settings = PipelineSettings {
        max_refinement_cycles: 1,
        ..fast_settings()
    };
    let h = harness(generator, retriever.clone(), settings);
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        task.outline.chapters[1].key_points,
        vec!["塔吊布置在北侧", "基坑深度六米"]
    );
    let queries = retriever.queries();
    let scope = Some("一号楼".to_string());
    assert_eq!(queries[0], ("一号楼 塔吊".to_string(), scope.clone()));
    assert_eq!(queries[1], ("一号楼 基坑".to_string(), scope.clone()));
    assert!(queries.iter().all(|(_, s)| s == &scope));

    let enrich: Vec<_> = h
        .generator
        .calls()
        .into_iter()
        .filter(|c| c.prompt.starts_with(prompts::ENRICH_TASK))
        .collect();
    assert_eq!(enrich.len(), 1);
    assert!(enrich[0]
        .context
        .as_deref()
        .is_some_and(|c| c.contains("塔吊布置在北侧")));
    assert!(task.error_log.is_empty());
}

#[tokio::test]
async fn test_failed_gap_search_is_recorded_and_outline_kept() {
    let generator = ScriptedGenerator::new(|p| {
        if p.starts_with(prompts::REVIEW_TASK) {
            return Ok(r#"{"changes": [], "gaps": [{"chapterId": "ch_02", "queryKeywords": ["塔吊"]}]}"#.to_string());
        }
        document_reply(p, &TITLES)
    });
    let settings = PipelineSettings {
        max_refinement_cycles: 1,
        ..fast_settings()
    };
    let h = harness(generator, Arc::new(FailingRetriever), settings);
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(h.generator.count(prompts::ENRICH_TASK), 0);
    assert_eq!(task.outline.chapters[1].key_points, vec!["主要内容要点", "主要内容细节"]);
    assert!(task.error_log.iter().any(|e| e.recoverable
        && e.stage == TaskStatus::RefiningOutline
        && e.message.contains("gap search unavailable")));
}

#[tokio::test]
async fn test_zero_refinement_cycles_skips_review() {
    let settings = PipelineSettings {
        max_refinement_cycles: 0,
        ..fast_settings()
    };
    let h = harness(happy_generator(), Arc::new(NoopRetriever), settings);
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.outline.metadata.refinement_cycles, 0);
    assert_eq!(h.generator.count(prompts::REVIEW_TASK), 0);
}

#[tokio::test]
async fn test_failing_chapter_two_fails_task_and_keeps_chapter_one() {
    let generator = ScriptedGenerator::new(|p| match chapter_line(p) {
        Some((id, _)) if id == "ch_02" => Err(GenerationError::transient("upstream 503")),
        _ => document_reply(p, &TITLES),
    });
    let h = harness(generator, Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let err = h.orchestrator.run(id).await.unwrap_err();
    match err {
        PipelineError::Fatal {
            stage,
            attempts,
            chapter_id,
            ..
        } => {
            assert_eq!(stage, TaskStatus::GeneratingChapters);
            assert_eq!(attempts, 3);
            assert_eq!(chapter_id.as_deref(), Some("ch_02"));
        }
        other => panic!("unexpected error: {}", other),
    }

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.final_document.is_empty());
    assert!(task.outline.chapters[0].is_generated());
    assert!(task.outline.chapters[1].content.is_none());
    assert_eq!(task.outline.chapters[1].generation_attempts, 3);
    assert!(task.outline.chapters[2].content.is_none());

    let last = task.last_error().unwrap();
    assert!(!last.recoverable);
    assert_eq!(last.stage, TaskStatus::GeneratingChapters);
    assert_eq!(last.chapter_id.as_deref(), Some("ch_02"));
    assert!(last.message.contains("ch_02"));
    let retries = task
        .error_log
        .iter()
        .filter(|e| e.recoverable && e.chapter_id.as_deref() == Some("ch_02"))
        .count();
    assert_eq!(retries, 2);

    let view = task.status_view();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.last_error.as_deref(), Some(last.message.as_str()));
    assert_snapshot_properties(&h.store.snapshots(id), 3);
}

#[tokio::test]
async fn test_transient_brief_failure_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let generator = ScriptedGenerator::new(move |p| {
        if p.starts_with(prompts::BRIEF_TASK) && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(GenerationError::Transient {
                message: "rate limited".into(),
                retry_after: Some(std::time::Duration::from_millis(1)),
            });
        }
        document_reply(p, &TITLES)
    });
    let h = harness(generator, Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(h.generator.count(prompts::BRIEF_TASK), 2);
    assert_eq!(task.error_log.len(), 1);
    assert!(task.error_log[0].recoverable);
    assert_eq!(task.error_log[0].stage, TaskStatus::AnalyzingBrief);
}

#[tokio::test]
async fn test_unparseable_brief_fails_after_corrective_retry() {
    let generator = ScriptedGenerator::new(|p| {
        if p.starts_with(prompts::BRIEF_TASK) {
            return Ok("抱歉，我无法完成。".to_string());
        }
        document_reply(p, &TITLES)
    });
    let h = harness(generator, Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let err = h.orchestrator.run(id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Fatal {
            stage: TaskStatus::AnalyzingBrief,
            attempts: 1,
            source: StageError::Content(_),
            ..
        }
    ));
    assert_eq!(h.generator.count(prompts::BRIEF_TASK), 2);

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failed_stage(), Some(TaskStatus::AnalyzingBrief));
    assert!(task.creative_brief.is_none());
}

#[tokio::test]
async fn test_unavailable_retrieval_degrades_to_ungrounded() {
    let h = harness(happy_generator(), Arc::new(FailingRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error_log.len(), 3);
    assert!(task.error_log.iter().all(|e| e.recoverable && e.chapter_id.is_some()));
}

#[tokio::test]
async fn test_grounded_chapters_receive_snippets() {
    let retriever = Arc::new(StaticRetriever::new(vec![Snippet::new("一号楼总建筑面积一万平方米", 0.8)]));
    let h = harness(happy_generator(), retriever.clone(), fast_settings());
    let id = create(h.store.as_ref()).await;

    h.orchestrator.run(id).await.unwrap();

    let queries = retriever.queries();
    assert_eq!(queries.len(), 3);
    assert!(queries.iter().all(|(q, scope)| q.starts_with("一号楼 ") && scope.as_deref() == Some("一号楼")));
    let chapter_calls: Vec<_> = h
        .generator
        .calls()
        .into_iter()
        .filter(|c| c.prompt.starts_with(prompts::CHAPTER_TASK))
        .collect();
    assert!(chapter_calls
        .iter()
        .all(|c| c.context.as_deref().is_some_and(|ctx| ctx.contains("一万平方米"))));
}

#[tokio::test]
async fn test_parallel_chapters_keep_outline_order() {
    let settings = PipelineSettings {
        chapter_concurrency: 3,
        ..fast_settings()
    };
    let h = harness(happy_generator(), Arc::new(NoopRetriever), settings);
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(section_titles(&task.final_document), TITLES);
    assert_snapshot_properties(&h.store.snapshots(id), 3);
}

#[tokio::test]
async fn test_outline_fallback_is_opt_in() {
    let broken_outline = || {
        ScriptedGenerator::new(|p| {
            if p.starts_with(prompts::OUTLINE_TASK) {
                return Ok("大纲如下：一、概述".to_string());
            }
            document_reply(p, &TITLES)
        })
    };

    let h = harness(broken_outline(), Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;
    assert!(h.orchestrator.run(id).await.is_err());
    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.failed_stage(), Some(TaskStatus::GeneratingOutline));
    assert!(task.creative_brief.is_some());

    let settings = PipelineSettings {
        outline_fallback: true,
        ..fast_settings()
    };
    let h = harness(broken_outline(), Arc::new(NoopRetriever), settings);
    let id = create(h.store.as_ref()).await;
    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(section_titles(&task.final_document), TITLES);
    assert!(task
        .error_log
        .iter()
        .any(|e| e.recoverable && e.stage == TaskStatus::GeneratingOutline));
}

#[tokio::test]
async fn test_unusable_review_keeps_outline() {
    let generator = ScriptedGenerator::new(|p| {
        if p.starts_with(prompts::REVIEW_TASK) {
            return Ok("看起来不错".to_string());
        }
        document_reply(p, &TITLES)
    });
    let h = harness(generator, Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.outline.metadata.refinement_cycles, 0);
    assert_eq!(task.outline.chapters.len(), 3);
    assert_eq!(task.error_log.len(), 1);
    assert_eq!(task.error_log[0].stage, TaskStatus::RefiningOutline);
    assert!(task.error_log[0].recoverable);
}

#[tokio::test]
async fn test_resume_from_persisted_snapshot() {
    let temp = tempdir().unwrap();
    let id = {
        let store = JsonTaskStore::open(temp.path()).await.unwrap();
        let id = create(&store).await;
        let mut outline = Outline::initial(
            TITLES
                .iter()
                .enumerate()
                .map(|(i, t)| Chapter::new(chapter_id(i + 1), t.to_string(), vec![]))
                .collect(),
        );
        outline.chapters[0].content = Some("已经写好的概述".into());
        outline.chapters[0].generation_attempts = 1;

        let mut stage = TaskStatus::Pending;
        while stage != TaskStatus::GeneratingChapters {
            let next = stage.next().unwrap();
            let outline = outline.clone();
            store
                .update(
                    id,
                    UpdateMode::Normal,
                    Box::new(move |t| {
                        t.status = next;
                        t.creative_brief = Some(CreativeBrief {
                            project_name: "一号楼".into(),
                            document_type: "施工方案".into(),
                            ..Default::default()
                        });
                        t.outline = outline;
                        t.progress_percentage = stage_progress(next).unwrap();
                        Ok(())
                    }),
                )
                .await
                .unwrap();
            stage = next;
        }
        id
    };

    let store = Arc::new(RecordingStore::wrap(JsonTaskStore::open(temp.path()).await.unwrap()));
    let generator = Arc::new(happy_generator());
    let orchestrator = Orchestrator::new(store.clone(), generator.clone(), Arc::new(NoopRetriever), fast_settings());

    let task = orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(generator.count(prompts::BRIEF_TASK), 0);
    assert_eq!(generator.count(prompts::OUTLINE_TASK), 0);
    assert_eq!(generator.count(prompts::CHAPTER_TASK), 2);
    assert_eq!(task.outline.chapters[0].content.as_deref(), Some("已经写好的概述"));
    assert_eq!(task.outline.chapters[0].generation_attempts, 1);
    assert!(task.final_document.contains("已经写好的概述"));

    let reloaded = JsonTaskStore::open(temp.path()).await.unwrap();
    assert_eq!(reloaded.get(id).await.unwrap(), task);
}

/// Blocks chapter ch_02 until released.
struct GatedGenerator {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl TextGenerator for GatedGenerator {
    async fn complete(&self, prompt: &str, _context: Option<&str>) -> Result<String, GenerationError> {
        if chapter_line(prompt).is_some_and(|(id, _)| id == "ch_02") {
            self.entered.notify_one();
            self.release.notified().await;
        }
        document_reply(prompt, &TITLES)
    }
}

#[tokio::test]
async fn test_cancel_discards_late_result() {
    let store = Arc::new(RecordingStore::new());
    let generator = Arc::new(GatedGenerator {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        generator.clone(),
        Arc::new(NoopRetriever),
        fast_settings(),
    ));
    let id = create(store.as_ref()).await;

    let driver = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(id).await })
    };

    generator.entered.notified().await;
    let cancelled = orchestrator.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    generator.release.notify_one();

    let task = driver.await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.outline.chapters[0].is_generated());
    assert!(task.outline.chapters[1].content.is_none());

    let last = task.last_error().unwrap();
    assert_eq!(last.message, USER_CANCELLED);
    assert!(!last.recoverable);
    assert_eq!(last.stage, TaskStatus::GeneratingChapters);
    assert_eq!(task, store.get(id).await.unwrap());

    let again = orchestrator.cancel(id).await.unwrap_err();
    assert!(matches!(
        again.as_state_error(),
        Some(StateError::Terminal { .. })
    ));
}

#[tokio::test]
async fn test_stage_retry_resumes_failed_chapter() {
    let broken = Arc::new(AtomicBool::new(true));
    let flag = broken.clone();
    let generator = ScriptedGenerator::new(move |p| match chapter_line(p) {
        Some((id, _)) if id == "ch_02" && flag.load(Ordering::SeqCst) => {
            Err(GenerationError::Content("refused".into()))
        }
        _ => document_reply(p, &TITLES),
    });
    let h = harness(generator, Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;

    assert!(h.orchestrator.run(id).await.is_err());
    let failed = h.store.get(id).await.unwrap();
    let progress_at_failure = failed.progress_percentage;

    broken.store(false, Ordering::SeqCst);
    let retried = h.orchestrator.prepare_retry(id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::GeneratingChapters);
    assert!(retried.progress_percentage >= progress_at_failure);
    let marker = retried.last_error().unwrap();
    assert!(marker.recoverable);
    assert_eq!(marker.message, "stage retry requested");

    let task = h.orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(section_titles(&task.final_document), TITLES);
    assert_eq!(task.outline.chapters[0].generation_attempts, 1);
    assert_eq!(task.outline.chapters[1].generation_attempts, 4);
    assert_snapshot_properties(&h.store.snapshots(id), 3);

    let err = h.orchestrator.prepare_retry(id).await.unwrap_err();
    assert!(matches!(
        err.as_state_error(),
        Some(StateError::NothingToRetry {
            status: TaskStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_prepare_retry_rejects_live_task() {
    let h = harness(happy_generator(), Arc::new(NoopRetriever), fast_settings());
    let id = create(h.store.as_ref()).await;
    let err = h.orchestrator.prepare_retry(id).await.unwrap_err();
    assert!(matches!(
        err.as_state_error(),
        Some(StateError::NothingToRetry {
            status: TaskStatus::Pending,
            ..
        })
    ));
    assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_markdown_export() {
    let temp = tempdir().unwrap();
    let settings = PipelineSettings {
        export_markdown: true,
        ..fast_settings()
    };
    let h = harness(happy_generator(), Arc::new(NoopRetriever), settings);
    let orchestrator = h.orchestrator.with_export_dir(temp.path().join("documents"));
    let id = create(h.store.as_ref()).await;

    let task = orchestrator.run(id).await.unwrap();
    let exported = std::fs::read_to_string(temp.path().join("documents").join(format!("{}.md", id))).unwrap();
    assert_eq!(exported, task.final_document);
}

/// Store whose `update` fails with an I/O error once, on the given call.
struct FlakyStore {
    inner: JsonTaskStore,
    updates: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, request: InitialRequest) -> Result<Task, StoreError> {
        self.inner.create(request).await
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
        if self.updates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.update(id, mode, mutator).await
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_storage_failure_marks_task_failed() {
    // Updates: start, brief, outline, then the refinement commit fails.
    let store = Arc::new(FlakyStore {
        inner: JsonTaskStore::in_memory(),
        updates: AtomicUsize::new(0),
        fail_on: 4,
    });
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(happy_generator()),
        Arc::new(NoopRetriever),
        fast_settings(),
    );
    let id = create(store.as_ref()).await;

    let err = orchestrator.run(id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::Io(_))));

    let task = store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failed_stage(), Some(TaskStatus::RefiningOutline));
    let last = task.last_error().unwrap();
    assert!(!last.recoverable);
    assert!(last.message.contains("disk full"));
    assert_eq!(task.status_view().last_error.as_deref(), Some(last.message.as_str()));
}

/// Holds the first ch_02 call until released, then answers it with a marker.
struct FirstCallGate {
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl TextGenerator for FirstCallGate {
    async fn complete(&self, prompt: &str, _context: Option<&str>) -> Result<String, GenerationError> {
        if chapter_line(prompt).is_some_and(|(id, _)| id == "ch_02") && self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
            return Ok("OLD-RUN".to_string());
        }
        document_reply(prompt, &TITLES)
    }
}

#[tokio::test]
async fn test_retried_task_drops_result_of_superseded_run() {
    let store = Arc::new(RecordingStore::new());
    let generator = Arc::new(FirstCallGate {
        gated: AtomicBool::new(true),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        generator.clone(),
        Arc::new(NoopRetriever),
        fast_settings(),
    ));
    let id = create(store.as_ref()).await;

    let old_run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(id).await })
    };
    generator.entered.notified().await;

    orchestrator.cancel(id).await.unwrap();
    let retried = orchestrator.prepare_retry(id).await.unwrap();
    assert_eq!(retried.run_epoch, 1);
    assert_eq!(retried.status, TaskStatus::GeneratingChapters);

    let task = orchestrator.run(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    generator.release.notify_one();
    let late = old_run.await.unwrap().unwrap();
    assert_eq!(late.status, TaskStatus::Completed);

    let task = store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_ne!(task.outline.chapters[1].content.as_deref(), Some("OLD-RUN"));
    assert!(!task.final_document.contains("OLD-RUN"));
    assert_eq!(task.outline.chapters[1].generation_attempts, 2);
    assert_eq!(task, late);
}
