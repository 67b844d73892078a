//! Task lifecycle: create, start, cancel, complete.
//!
//! [`TaskScheduler`] owns the durable task table, the in-memory registry of
//! live workers and a bounded pool of worker slots. Every started task gets
//! exactly one worker, which runs the pipeline under its own cancellation
//! token, writes one terminal state and then deletes the task's source file.

pub mod janitor;
pub mod registry;


use crate::database::{Database, ResultRef, StoredResult, TaskCounts, TaskRecord, TaskStatus};
use crate::error::AppError;
use crate::pipeline::{PageRange, Pipeline, ProgressSink, SourceInput, StageContext};
use crate::sink::{ResultSink, SaveRequest};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use janitor::FileJanitor;
use registry::{InFlightTask, TaskRegistry};

/// Optional request details passed to [`TaskScheduler::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub page_range: Option<PageRange>,
    /// Copied into the saved result's metadata as-is.
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
}

/// How a worker's run ended, before it is written down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(ResultRef),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    /// Another transition got there first; the task already had this status.
    AlreadyTerminal(TaskStatus),
}

struct Job {
    task_id: i64,
    owner_id: i64,
    input: SourceInput,
    extra_metadata: serde_json::Map<String, serde_json::Value>,
    token: CancellationToken,
}

/// Writes stage progress straight to the task row.
struct TaskProgress {
    db: Arc<Database>,
    task_id: i64,
}

impl ProgressSink for TaskProgress {
    fn report(&self, percent: i32, stage: &str, detail: &str) {
        if let Err(e) = self.db.update_progress(self.task_id, percent, stage, detail) {
            log::warn!("Failed to update progress for task {}: {}", self.task_id, e);
        }
    }
}

struct SchedulerInner {
    db: Arc<Database>,
    registry: TaskRegistry,
    pipeline: Pipeline,
    sink: Arc<dyn ResultSink>,
    janitor: FileJanitor,
    permits: Semaphore,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Cheap to clone; all clones share one set of workers.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        db: Arc<Database>,
        pipeline: Pipeline,
        sink: Arc<dyn ResultSink>,
        max_concurrent: usize,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                registry: TaskRegistry::new(shutdown.clone()),
                pipeline,
                sink,
                janitor: FileJanitor,
                permits: Semaphore::new(max_concurrent.max(1)),
                shutdown,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn create_task(&self, owner_id: i64, filename: &str) -> Result<i64, AppError> {
        let task_id = self.inner.db.create_task(owner_id, filename)?;
        log::info!("Created task {} for owner {} ({})", task_id, owner_id, filename);
        Ok(task_id)
    }

    /// Hand `path` to a new worker for `task_id` and return at once.
    ///
    /// The task owns `path` from here on: it is deleted when the task ends,
    /// whatever the outcome. A task that is already terminal gets no worker;
    /// its file is deleted straight away. A cancel that lands between that
    /// check and registration leaves the worker a pre-tripped token.
    pub fn start(
        &self,
        task_id: i64,
        owner_id: i64,
        path: PathBuf,
        filename: &str,
        options: StartOptions,
    ) -> Result<(), AppError> {
        let inner = &self.inner;
        let Some(task) = inner.db.get_task_for_owner(task_id, owner_id)? else {
            return Err(AppError::NotFound(format!("task {}", task_id)));
        };
        if task.status.is_terminal() {
            log::info!("Task {} is already {}, not starting", task_id, task.status);
            let janitor = inner.janitor;
            inner
                .tracker
                .spawn(async move { janitor.cleanup(&path).await });
            return Ok(());
        }

        let token = inner.registry.register(task_id, filename)?;
        let status = match inner.prepare(task_id, &path) {
            Ok(status) => status,
            Err(e) => {
                inner.registry.evict(task_id);
                return Err(e);
            }
        };
        if status != TaskStatus::Processing {
            log::info!("Task {} became {} while starting", task_id, status);
            inner.registry.mark_cancelled(task_id);
        }

        let job = Job {
            task_id,
            owner_id,
            input: SourceInput {
                path,
                filename: filename.to_string(),
                page_range: options.page_range,
            },
            extra_metadata: options.extra_metadata,
            token,
        };
        let worker = self.inner.clone();
        let span = tracing::info_span!("task", id = task_id, owner = owner_id);
        inner
            .tracker
            .spawn(async move { worker.run_worker(job).await }.instrument(span));
        Ok(())
    }

    /// Owner-scoped cancel. `false` for an unknown id, another owner's task
    /// or a task that has already finished.
    pub fn cancel(&self, task_id: i64, owner_id: i64) -> Result<bool, AppError> {
        let cancelled = self.inner.db.cancel_task(task_id, owner_id)?;
        if cancelled {
            let live = self.inner.registry.mark_cancelled(task_id);
            log::info!(
                "Task {} cancelled by owner {}{}",
                task_id,
                owner_id,
                if live { "" } else { " (no live worker)" }
            );
        }
        Ok(cancelled)
    }

    pub fn is_cancelled(&self, task_id: i64) -> bool {
        self.inner.is_cancelled(task_id)
    }

    pub fn complete(
        &self,
        task_id: i64,
        outcome: &TaskOutcome,
    ) -> Result<CompletionOutcome, AppError> {
        self.inner.complete(task_id, outcome)
    }

    /// Best effort; a failed write is logged and dropped.
    pub fn update_progress(&self, task_id: i64, percent: i32, stage: &str, detail: &str) {
        TaskProgress {
            db: self.inner.db.clone(),
            task_id,
        }
        .report(percent, stage, detail);
    }

    pub fn status(&self, task_id: i64, owner_id: i64) -> Result<Option<TaskRecord>, AppError> {
        Ok(self.inner.db.get_task_for_owner(task_id, owner_id)?)
    }

    /// Look up a saved result by the token handed out on completion.
    pub fn result(&self, access_token: &str) -> Result<Option<StoredResult>, AppError> {
        Ok(self.inner.db.get_result_by_token(access_token)?)
    }

    pub fn list(&self, owner_id: Option<i64>, limit: i64) -> Result<Vec<TaskRecord>, AppError> {
        Ok(self.inner.db.list_tasks(owner_id, limit)?)
    }

    pub fn counts(&self) -> Result<TaskCounts, AppError> {
        Ok(self.inner.db.count_tasks()?)
    }

    pub fn in_flight(&self) -> Vec<InFlightTask> {
        self.inner.registry.snapshot()
    }

    pub fn update_filename(&self, task_id: i64, filename: &str) -> Result<(), AppError> {
        Ok(self.inner.db.update_filename(task_id, filename)?)
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Fail tasks left processing by a previous process. Call before the
    /// first `start`.
    pub fn recover_interrupted(&self) -> Result<usize, AppError> {
        Ok(self.inner.db.fail_interrupted_tasks()?)
    }

    pub fn prune_old_tasks(&self, days: i64) -> Result<usize, AppError> {
        let deleted = self.inner.db.delete_old_tasks(days)?;
        if deleted > 0 {
            log::info!("Pruned {} tasks older than {} days", deleted, days);
        }
        Ok(deleted)
    }

    /// Delete stale files in `upload_dir` that no processing task owns.
    pub async fn sweep_orphans(
        &self,
        upload_dir: &Path,
        max_age: Duration,
    ) -> Result<Vec<PathBuf>, AppError> {
        let active: HashSet<PathBuf> = self
            .inner
            .db
            .active_source_files()?
            .into_iter()
            .map(PathBuf::from)
            .collect();
        Ok(self
            .inner
            .janitor
            .sweep_orphans(upload_dir, max_age, &active)
            .await)
    }

    /// Interrupt every worker and wait until all of them have written their
    /// terminal state and cleaned up.
    pub async fn shutdown(&self) {
        let running = self.inner.registry.snapshot().len();
        if running > 0 {
            log::info!("Shutting down with {} tasks in flight", running);
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl SchedulerInner {
    fn prepare(&self, task_id: i64, path: &Path) -> Result<TaskStatus, AppError> {
        self.db.set_source_file(task_id, &path.to_string_lossy())?;
        self.db
            .get_status(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))
    }

    fn is_cancelled(&self, task_id: i64) -> bool {
        if let Some(flag) = self.registry.is_cancelled(task_id) {
            return flag;
        }
        match self.db.get_status(task_id) {
            Ok(status) => status == Some(TaskStatus::Cancelled),
            Err(e) => {
                log::warn!("Failed to read status of task {}: {}", task_id, e);
                false
            }
        }
    }

    fn complete(&self, task_id: i64, outcome: &TaskOutcome) -> Result<CompletionOutcome, AppError> {
        let written = self.write_terminal(task_id, outcome);
        self.registry.evict(task_id);
        written
    }

    fn write_terminal(
        &self,
        task_id: i64,
        outcome: &TaskOutcome,
    ) -> Result<CompletionOutcome, AppError> {
        let applied = match outcome {
            TaskOutcome::Completed(result) => self.db.mark_completed(task_id, result)?,
            TaskOutcome::Cancelled => self.db.mark_cancelled(task_id)?,
            TaskOutcome::Failed(error) => self.db.mark_failed(task_id, error)?,
        };
        if applied {
            return Ok(CompletionOutcome::Applied);
        }
        let status = self
            .db
            .get_status(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;
        Ok(CompletionOutcome::AlreadyTerminal(status))
    }

    async fn run_worker(&self, job: Job) {
        let task_id = job.task_id;
        let outcome = match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => TaskOutcome::Failed(format!("worker panicked: {}", panic_message(&*panic))),
        };

        let completion = self.complete(task_id, &outcome);
        match (&outcome, &completion) {
            (TaskOutcome::Completed(_), Ok(CompletionOutcome::Applied)) => {
                log::info!("Task {} completed", task_id)
            }
            (TaskOutcome::Cancelled, Ok(CompletionOutcome::Applied))
            | (
                TaskOutcome::Cancelled,
                Ok(CompletionOutcome::AlreadyTerminal(TaskStatus::Cancelled)),
            ) => log::info!("Task {} cancelled", task_id),
            (TaskOutcome::Failed(error), Ok(CompletionOutcome::Applied)) => {
                log::error!("Task {} failed: {}", task_id, error)
            }
            (_, Ok(CompletionOutcome::AlreadyTerminal(status))) => {
                log::info!("Task {} was already {} when the worker finished", task_id, status)
            }
            (_, Err(e)) => log::error!("Failed to record outcome of task {}: {}", task_id, e),
        }

        if let TaskOutcome::Completed(result) = &outcome {
            if !matches!(completion, Ok(CompletionOutcome::Applied)) {
                match self.sink.discard(result).await {
                    Ok(()) => log::info!("Discarded result {} of task {}", result.id, task_id),
                    Err(e) => log::error!("Failed to discard result {}: {}", result.id, e),
                }
            }
        }

        self.janitor.cleanup(&job.input.path).await;
    }

    async fn execute(&self, job: &Job) -> TaskOutcome {
        let progress = TaskProgress {
            db: self.db.clone(),
            task_id: job.task_id,
        };
        let ctx = StageContext::new(job.task_id, &job.token, &progress);

        progress.report(5, "queued", "waiting for a worker slot");
        let _permit = tokio::select! {
            _ = job.token.cancelled() => return self.interrupted(job.task_id),
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => return TaskOutcome::Failed(format!("worker pool closed: {}", e)),
            },
        };

        let artifact = match self.pipeline.run(&job.input, &ctx).await {
            Ok(artifact) => artifact,
            Err(e) if e.is_cancelled() => return self.interrupted(job.task_id),
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        // Late cancel beats an unsaved result
        if job.token.is_cancelled() || self.is_cancelled(job.task_id) {
            return self.interrupted(job.task_id);
        }

        progress.report(95, "saving", "");
        let request = SaveRequest {
            owner_id: job.owner_id,
            task_id: job.task_id,
            filename: job.input.filename.clone(),
            file_type: job.input.file_type(),
            extra_metadata: save_metadata(job),
            artifact,
        };
        match self.sink.save(request).await {
            Ok(result) => TaskOutcome::Completed(result),
            Err(e) => TaskOutcome::Failed(format!("saving result failed: {}", e)),
        }
    }

    /// Outcome for a run that stopped on its token: a user cancel, or the
    /// process shutting down underneath it.
    fn interrupted(&self, task_id: i64) -> TaskOutcome {
        if self.is_cancelled(task_id) {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Failed("interrupted by shutdown".to_string())
        }
    }
}

fn save_metadata(job: &Job) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = job.extra_metadata.clone();
    if let Some(range) = &job.input.page_range {
        metadata.insert("page_range".into(), range.to_string().into());
    }
    metadata.insert("file_type".into(), job.input.file_type().into());
    metadata.insert(
        "processed_at".into(),
        chrono::Utc::now().to_rfc3339().into(),
    );
    metadata
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
