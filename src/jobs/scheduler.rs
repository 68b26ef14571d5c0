use anyhow::{Result, bail};
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use super::events::{EventHub, EventSink, JobEvent};
use super::model::{Job, JobConfig, JobResult, JobStatus};
use super::runner::{JobContext, JobRunner, ProgressReporter};
use super::store::JobStore;
use super::writer::StoreWriter;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub uploads_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

/// Where a job landed on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Running,
    Queued,
    /// The source file is missing; the job is recorded but never starts.
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub status: Admission,
    pub owner_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub cancelled: Vec<String>,
    pub not_found: Vec<String>,
    pub errors: Vec<DeleteError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteError {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub running: usize,
    pub queued: usize,
    pub invalid: usize,
}

struct QueueEntry {
    created_at: OffsetDateTime,
    job_id: String,
    config: JobConfig,
}

#[derive(Default)]
pub(super) struct State {
    pub(super) jobs: HashMap<String, Job>,
    queue: Vec<QueueEntry>,
    /// Running jobs and the handle that cancels them. `None` once cancellation was requested.
    pub(super) running: HashMap<String, Option<oneshot::Sender<()>>>,
}

pub(super) struct Inner {
    pub(super) config: SchedulerConfig,
    pub(super) store: Arc<dyn JobStore>,
    writer: StoreWriter,
    hub: Arc<EventHub>,
    runner: Arc<dyn JobRunner>,
    state: Mutex<State>,
}

enum Outcome {
    Completed(JobResult),
    Failed(String),
    Cancelled,
}

/// Admits jobs under a concurrency cap, queues the rest oldest first, and
/// keeps the job table and the store in step with every transition.
///
/// Operations that can start a job must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        hub: Arc<EventHub>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let config = SchedulerConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                writer: StoreWriter::spawn(store.clone()),
                store,
                hub,
                runner,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.inner.hub
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn source_path(&self, config: &JobConfig) -> PathBuf {
        self.inner.config.uploads_dir.join(config.source_file_name())
    }

    pub(super) fn output_dir(&self, job_id: &str) -> PathBuf {
        self.inner.config.outputs_dir.join(job_id)
    }

    /// Queues a snapshot for the store writer. Called under the state lock so
    /// snapshots reach the store in transition order.
    pub(super) fn persist(&self, job: &Job) {
        self.inner.writer.upsert(job.clone());
    }

    /// Blocks until every queued job snapshot has been written.
    pub fn flush_store(&self) {
        self.inner.writer.flush();
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Creates a job for `config` and either starts or queues it.
    pub fn submit(
        &self,
        config: JobConfig,
        created_at: OffsetDateTime,
        owner: Option<String>,
    ) -> Result<Submission> {
        config.validate()?;
        let job_id = Uuid::new_v4().simple().to_string();
        let owner_token = Uuid::new_v4().simple().to_string();
        let mut job = Job::new(job_id.clone(), config, created_at, owner_token.clone());
        job.owner = owner;
        let status = self.admit(job);
        Ok(Submission {
            job_id,
            status,
            owner_token,
        })
    }

    fn admit(&self, mut job: Job) -> Admission {
        let source = self.source_path(&job.config);
        if !source.exists() {
            let reason = format!("source file not found: {}", job.config.source_file_name());
            tracing::warn!("job {} is invalid: {}", job.id, reason);
            job.status = JobStatus::Invalid;
            job.stage = "invalid".to_string();
            job.error = Some(reason.clone());
            job.message = Some(reason.clone());
            job.end_time = Some(OffsetDateTime::now_utc());
            let mut state = self.lock();
            self.persist(&job);
            state.jobs.insert(job.id.clone(), job.clone());
            self.inner.hub.publish(&job.id, JobEvent::Error { error: reason });
            return Admission::Invalid;
        }

        let job_id = job.id.clone();
        let mut state = self.lock();
        job.status = JobStatus::Queued;
        job.stage = "queued".to_string();
        job.end_time = None;
        self.persist(&job);
        let entry = QueueEntry {
            created_at: job.created_at,
            job_id: job_id.clone(),
            config: job.config.clone(),
        };
        state.jobs.insert(job_id.clone(), job);

        if state.running.len() < self.inner.config.max_concurrent && state.queue.is_empty() {
            self.start_locked(&mut state, entry);
            return Admission::Running;
        }
        state.queue.push(entry);
        state.queue.sort_by_key(|entry| entry.created_at);
        self.drain_locked(&mut state);
        if state.running.contains_key(&job_id) {
            return Admission::Running;
        }
        tracing::info!(
            "job {} queued at position {}",
            job_id,
            position_in(&state.queue, &job_id).unwrap_or(0)
        );
        self.inner.hub.publish(&job_id, JobEvent::progress(0.0, "queued"));
        Admission::Queued
    }

    /// Starts queued jobs, oldest first, while there is room under the cap.
    pub fn drain(&self) {
        let mut state = self.lock();
        self.drain_locked(&mut state);
    }

    fn drain_locked(&self, state: &mut State) {
        while state.running.len() < self.inner.config.max_concurrent && !state.queue.is_empty() {
            let entry = state.queue.remove(0);
            if !state.jobs.contains_key(&entry.job_id) {
                continue;
            }
            self.start_locked(state, entry);
        }
    }

    fn start_locked(&self, state: &mut State, entry: QueueEntry) {
        let QueueEntry { job_id, config, .. } = entry;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::Running;
            job.stage = "starting".to_string();
            job.start_time = Some(OffsetDateTime::now_utc());
            self.persist(job);
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.running.insert(job_id.clone(), Some(cancel_tx));
        tracing::info!(
            "job {} started ({}/{} running)",
            job_id,
            state.running.len(),
            self.inner.config.max_concurrent
        );
        self.inner.hub.publish(&job_id, JobEvent::progress(0.0, "starting"));
        tokio::spawn(self.clone().run_job(job_id, config, cancel_rx));
    }

    async fn run_job(self, job_id: String, config: JobConfig, cancel_rx: oneshot::Receiver<()>) {
        let recorder: Arc<dyn EventSink> = Arc::new(JobEventRecorder {
            scheduler: self.clone(),
        });
        let ctx = JobContext {
            job_id: job_id.clone(),
            source_path: self.source_path(&config),
            output_dir: self.output_dir(&job_id),
            progress: ProgressReporter::new(job_id.clone(), recorder),
            config,
        };
        let work = AssertUnwindSafe(self.inner.runner.run(ctx)).catch_unwind();

        let outcome = tokio::select! {
            result = work => match result {
                Ok(Ok(result)) => Outcome::Completed(result),
                Ok(Err(err)) => Outcome::Failed(format!("{:#}", err)),
                Err(panic) => Outcome::Failed(panic_message(panic)),
            },
            _ = cancel_rx => Outcome::Cancelled,
        };
        self.finish(&job_id, outcome);
        self.drain();
    }

    fn finish(&self, job_id: &str, outcome: Outcome) {
        let mut state = self.lock();
        state.running.remove(job_id);
        let Some(job) = state.jobs.get_mut(job_id) else {
            tracing::debug!("job {} finished after it was deleted", job_id);
            return;
        };
        job.end_time = Some(OffsetDateTime::now_utc());
        let event = match outcome {
            Outcome::Completed(result) => {
                tracing::info!("job {} completed in {:.1}s", job_id, result.total_seconds);
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.stage = "completed".to_string();
                job.result = Some(result.clone());
                JobEvent::Finish {
                    translate_result: result,
                }
            }
            Outcome::Failed(error) => {
                tracing::error!("job {} failed: {}", job_id, error);
                job.status = JobStatus::Error;
                job.stage = "error".to_string();
                job.error = Some(error.clone());
                JobEvent::Error { error }
            }
            Outcome::Cancelled => {
                tracing::info!("job {} cancelled", job_id);
                job.status = JobStatus::Cancelled;
                job.stage = "cancelled".to_string();
                JobEvent::progress(job.progress, "cancelled")
            }
        };
        let retired = job.status == JobStatus::Cancelled;
        self.persist(job);
        self.inner.hub.publish(job_id, event);
        if retired {
            self.inner.hub.forget(job_id);
        }
    }

    /// Cancels a running job, or withdraws a queued one. Returns false when the
    /// job is neither running nor queued.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        if let Some(handle) = state.running.get_mut(job_id) {
            return match handle.take() {
                Some(sender) => sender.send(()).is_ok(),
                None => false,
            };
        }
        if !remove_entry(&mut state.queue, job_id) {
            return false;
        }
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = JobStatus::Cancelled;
            job.stage = "cancelled".to_string();
            job.end_time = Some(OffsetDateTime::now_utc());
            self.persist(job);
        }
        tracing::info!("job {} withdrawn from the queue", job_id);
        self.inner
            .hub
            .publish(job_id, JobEvent::progress(0.0, "cancelled"));
        self.inner.hub.forget(job_id);
        true
    }

    /// Drops a queued entry. Running jobs are not affected.
    pub fn remove_from_queue(&self, job_id: &str) -> bool {
        remove_entry(&mut self.lock().queue, job_id)
    }

    pub(super) fn remove_from_queue_locked(&self, state: &mut State, job_id: &str) -> bool {
        remove_entry(&mut state.queue, job_id)
    }

    /// 1-based queue position; `None` unless the job is waiting in the queue.
    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        position_in(&self.lock().queue, job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobView>> {
        let memory = {
            let state = self.lock();
            state.jobs.get(job_id).cloned().map(|job| JobView {
                queue_position: position_in(&state.queue, job_id),
                job,
            })
        };
        if memory.is_some() {
            return Ok(memory);
        }
        Ok(self.inner.store.get_full(job_id)?.map(|job| JobView {
            job,
            queue_position: None,
        }))
    }

    /// Every known job, newest first.
    pub fn list(&self) -> Result<Vec<JobView>> {
        let mut jobs: HashMap<String, Job> = self
            .inner
            .store
            .list()?
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        let state = self.lock();
        for (id, job) in &state.jobs {
            jobs.insert(id.clone(), job.clone());
        }
        let mut views: Vec<JobView> = jobs
            .into_values()
            .map(|job| JobView {
                queue_position: position_in(&state.queue, &job.id),
                job,
            })
            .collect();
        drop(state);
        views.sort_by(|a, b| b.job.created_at.cmp(&a.job.created_at));
        Ok(views)
    }

    /// Cancels, forgets and deletes each job the caller owns, along with its output.
    pub async fn delete_jobs(&self, ids: &[String], owner_token: Option<&str>) -> DeleteReport {
        let mut report = DeleteReport::default();
        for id in ids {
            let job = match self.status(id) {
                Ok(Some(view)) => view.job,
                Ok(None) => {
                    report.not_found.push(id.clone());
                    continue;
                }
                Err(err) => {
                    report.errors.push(DeleteError {
                        id: id.clone(),
                        error: format!("{:#}", err),
                    });
                    continue;
                }
            };
            if !job.is_owned_by(owner_token) {
                report.errors.push(DeleteError {
                    id: id.clone(),
                    error: "owner token does not match".to_string(),
                });
                continue;
            }

            let was_active = {
                let mut state = self.lock();
                let cancelled = match state.running.get_mut(id) {
                    Some(handle) => {
                        if let Some(sender) = handle.take() {
                            let _ = sender.send(());
                        }
                        true
                    }
                    None => remove_entry(&mut state.queue, id),
                };
                state.jobs.remove(id);
                cancelled
            };
            if was_active {
                report.cancelled.push(id.clone());
            }

            if let Err(err) = self.inner.writer.delete(id).await {
                report.errors.push(DeleteError {
                    id: id.clone(),
                    error: format!("{:#}", err),
                });
                continue;
            }
            self.inner.hub.forget(id);
            let output_dir = self.output_dir(id);
            match tokio::fs::remove_dir_all(&output_dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(
                    "failed to remove outputs of job {} at {}: {}",
                    id,
                    output_dir.display(),
                    err
                ),
            }
            tracing::info!("job {} deleted", id);
            report.deleted.push(id.clone());
        }
        self.drain();
        report
    }

    /// Re-admits unfinished jobs from the store, oldest first, keeping their
    /// original `created_at` and owner token.
    pub fn resume_from_store(&self) -> Result<ResumeReport> {
        let mut pending: Vec<Job> = self
            .inner
            .store
            .list()?
            .into_iter()
            .filter(|job| matches!(job.status, JobStatus::Running | JobStatus::Queued))
            .filter(|job| job.progress < 100.0)
            .collect();
        pending.sort_by_key(|job| job.created_at);

        let mut report = ResumeReport::default();
        for mut job in pending {
            if self.lock().jobs.contains_key(&job.id) {
                continue;
            }
            if let Err(err) = job.config.validate() {
                tracing::warn!("job {} cannot be resumed: {:#}", job.id, err);
                continue;
            }
            job.progress = 0.0;
            job.start_time = None;
            match self.admit(job) {
                Admission::Running => report.running += 1,
                Admission::Queued => report.queued += 1,
                Admission::Invalid => report.invalid += 1,
            }
        }
        if report != ResumeReport::default() {
            tracing::info!(
                "resumed jobs: {} running, {} queued, {} invalid",
                report.running,
                report.queued,
                report.invalid
            );
        }
        Ok(report)
    }

    /// Waits until the job reaches a terminal status and returns its final record.
    pub async fn wait_for(&self, job_id: &str) -> Result<Job> {
        let (_, mut events) = self.inner.hub.subscribe(job_id);
        let outcome = self.wait_on(job_id, &mut events).await;
        self.inner.hub.unsubscribe(job_id, events);
        outcome
    }

    async fn wait_on(&self, job_id: &str, events: &mut broadcast::Receiver<JobEvent>) -> Result<Job> {
        loop {
            match self.status(job_id)? {
                Some(view) if view.job.status.is_terminal() => return Ok(view.job),
                Some(_) => {}
                None => bail!("unknown job {}", job_id),
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    match self.status(job_id)? {
                        Some(view) if view.job.status.is_terminal() => return Ok(view.job),
                        _ => bail!("job {} went away while waiting", job_id),
                    }
                }
            }
        }
    }
}

/// Applies a running job's progress to its record, then forwards the event.
struct JobEventRecorder {
    scheduler: Scheduler,
}

impl EventSink for JobEventRecorder {
    fn publish(&self, job_id: &str, event: JobEvent) {
        let event = event.normalized();
        {
            let mut state = self.scheduler.lock();
            if let JobEvent::ProgressUpdate {
                overall_progress,
                stage,
                message,
            } = &event
                && let Some(job) = state.jobs.get_mut(job_id)
                && job.status == JobStatus::Running
            {
                job.progress = *overall_progress;
                job.stage = stage.clone();
                job.message = message.clone();
                self.scheduler.persist(job);
            }
        }
        self.scheduler.inner.hub.publish(job_id, event);
    }
}

fn remove_entry(queue: &mut Vec<QueueEntry>, job_id: &str) -> bool {
    let before = queue.len();
    queue.retain(|entry| entry.job_id != job_id);
    queue.len() != before
}

/// One more than the number of queued jobs created strictly earlier.
fn position_in(queue: &[QueueEntry], job_id: &str) -> Option<usize> {
    let target = queue.iter().find(|entry| entry.job_id == job_id)?;
    Some(
        1 + queue
            .iter()
            .filter(|entry| entry.created_at < target.created_at)
            .count(),
    )
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("job panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobFuture, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Each job blocks until released; tracks the peak number running at once.
    #[derive(Default)]
    struct GatedRunner {
        release: Notify,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl JobRunner for Arc<GatedRunner> {
        fn run(&self, ctx: JobContext) -> JobFuture {
            let runner = self.clone();
            Box::pin(async move {
                runner.started.lock().unwrap().push(ctx.config.file_id.clone());
                let now = runner.active.fetch_add(1, Ordering::SeqCst) + 1;
                runner.peak.fetch_max(now, Ordering::SeqCst);
                let _guard = ActiveGuard(&runner.active);
                ctx.progress.report(50.0, "working");
                runner.release.notified().await;
                if ctx.config.file_id.starts_with("boom") {
                    panic!("renderer exploded");
                }
                if ctx.config.file_id.starts_with("fail") {
                    anyhow::bail!("bad page");
                }
                Ok(JobResult {
                    mono_pdf_path: None,
                    total_seconds: 0.0,
                    pages: 1,
                    regions_translated: 0,
                })
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        scheduler: Scheduler,
        runner: Arc<GatedRunner>,
        uploads: PathBuf,
        store: Arc<MemoryStore>,
    }

    fn fixture(cap: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let runner = Arc::new(GatedRunner::default());
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_concurrent: cap,
                uploads_dir: uploads.clone(),
                outputs_dir: dir.path().join("outputs"),
            },
            store.clone(),
            Arc::new(EventHub::new()),
            Arc::new(runner.clone()),
        );
        Fixture {
            _dir: dir,
            scheduler,
            runner,
            uploads,
            store,
        }
    }

    impl Fixture {
        fn submit(&self, file_id: &str, secs: i64) -> Submission {
            std::fs::write(self.uploads.join(format!("{}.pdf", file_id)), b"%PDF").unwrap();
            self.scheduler
                .submit(JobConfig::new(file_id, "en", "fr"), at(secs), None)
                .unwrap()
        }

        async fn release_one(&self) {
            self.runner.release.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        fn job(&self, id: &str) -> Job {
            self.scheduler.status(id).unwrap().unwrap().job
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn second_job_waits_then_gets_promoted() {
        let fx = fixture(1);
        let a = fx.submit("a", 0);
        let b = fx.submit("b", 1);
        assert_eq!(a.status, Admission::Running);
        assert_eq!(b.status, Admission::Queued);
        assert_eq!(fx.scheduler.queue_position(&b.job_id), Some(1));
        assert_eq!(fx.scheduler.queue_position(&a.job_id), None);
        settle().await;

        fx.release_one().await;
        assert_eq!(fx.job(&a.job_id).status, JobStatus::Completed);
        assert_eq!(fx.job(&b.job_id).status, JobStatus::Running);
        assert_eq!(fx.scheduler.queue_position(&b.job_id), None);

        fx.release_one().await;
        let done = fx.scheduler.wait_for(&b.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(*fx.runner.started.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn never_exceeds_the_cap() {
        let fx = fixture(2);
        let ids: Vec<String> = (0..6).map(|i| fx.submit(&format!("f{}", i), i).job_id).collect();
        settle().await;
        assert_eq!(fx.scheduler.running_count(), 2);
        for _ in 0..6 {
            fx.release_one().await;
        }
        for id in &ids {
            assert_eq!(fx.job(id).status, JobStatus::Completed);
        }
        assert_eq!(fx.runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(*fx.runner.started.lock().unwrap(), ["f0", "f1", "f2", "f3", "f4", "f5"]);
    }

    #[tokio::test]
    async fn queue_orders_by_created_at_not_submission_order() {
        let fx = fixture(1);
        fx.submit("first", 0);
        let late = fx.submit("late", 30);
        let early = fx.submit("early", 10);
        assert_eq!(fx.scheduler.queue_position(&early.job_id), Some(1));
        assert_eq!(fx.scheduler.queue_position(&late.job_id), Some(2));
        settle().await;
        fx.release_one().await;
        assert_eq!(fx.job(&early.job_id).status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_never_starts_it() {
        let fx = fixture(1);
        let a = fx.submit("a", 0);
        let b = fx.submit("b", 1);
        assert!(fx.scheduler.cancel(&b.job_id));
        assert_eq!(fx.job(&b.job_id).status, JobStatus::Cancelled);
        assert_eq!(fx.scheduler.queue_position(&b.job_id), None);
        assert!(!fx.scheduler.cancel(&b.job_id));

        settle().await;
        fx.release_one().await;
        assert_eq!(fx.job(&a.job_id).status, JobStatus::Completed);
        assert_eq!(*fx.runner.started.lock().unwrap(), ["a"]);
        fx.scheduler.flush_store();
        let stored = fx.store.get_full(&b.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_running_job_frees_its_slot() {
        let fx = fixture(1);
        let a = fx.submit("a", 0);
        let b = fx.submit("b", 1);
        settle().await;
        assert!(fx.scheduler.cancel(&a.job_id));
        settle().await;
        assert_eq!(fx.job(&a.job_id).status, JobStatus::Cancelled);
        assert_eq!(fx.job(&b.job_id).status, JobStatus::Running);
    }

    #[tokio::test]
    async fn failures_and_panics_are_recorded_and_drain_continues() {
        let fx = fixture(1);
        let boom = fx.submit("boom", 0);
        let fail = fx.submit("fail", 1);
        let ok = fx.submit("ok", 2);
        settle().await;
        fx.release_one().await;
        let job = fx.job(&boom.job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.unwrap().contains("renderer exploded"));
        fx.release_one().await;
        let job = fx.job(&fail.job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("bad page"));
        fx.release_one().await;
        assert_eq!(fx.job(&ok.job_id).status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn missing_source_is_invalid_on_admission() {
        let fx = fixture(1);
        let sub = fx
            .scheduler
            .submit(JobConfig::new("ghost", "en", "fr"), at(0), None)
            .unwrap();
        assert_eq!(sub.status, Admission::Invalid);
        let job = fx.job(&sub.job_id);
        assert_eq!(job.status, JobStatus::Invalid);
        assert_eq!(fx.scheduler.running_count(), 0);
        assert!(fx.runner.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_events_update_the_record() {
        let fx = fixture(1);
        let a = fx.submit("a", 0);
        settle().await;
        let job = fx.job(&a.job_id);
        assert_eq!(job.progress, 50.0);
        assert_eq!(job.stage, "working");
        fx.scheduler.flush_store();
        assert_eq!(fx.store.get_full(&a.job_id).unwrap().unwrap().stage, "working");
        fx.release_one().await;
    }

    #[tokio::test]
    async fn delete_checks_owner_and_cancels() {
        let fx = fixture(1);
        let a = fx.submit("a", 0);
        let b = fx.submit("b", 1);
        settle().await;

        let ids = vec![a.job_id.clone(), b.job_id.clone(), "missing".to_string()];
        let report = fx.scheduler.delete_jobs(&ids, Some("wrong")).await;
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.not_found, ["missing"]);

        let report = fx.scheduler.delete_jobs(&ids[..1], Some(&a.owner_token)).await;
        assert_eq!(report.deleted, [a.job_id.clone()]);
        assert_eq!(report.cancelled, [a.job_id.clone()]);
        assert!(fx.scheduler.status(&a.job_id).unwrap().is_none());
        settle().await;
        assert_eq!(fx.job(&b.job_id).status, JobStatus::Running);
    }

    /// Holds every write until the gate opens.
    struct GatedStore {
        gate: std::sync::RwLock<()>,
        inner: MemoryStore,
    }

    impl JobStore for GatedStore {
        fn upsert(&self, job: &Job) -> Result<()> {
            let _open = self.gate.read().unwrap();
            self.inner.upsert(job)
        }
        fn list(&self) -> Result<Vec<Job>> {
            self.inner.list()
        }
        fn get_full(&self, id: &str) -> Result<Option<Job>> {
            self.inner.get_full(id)
        }
        fn mark_invalid(&self, id: &str, reason: &str) -> Result<bool> {
            self.inner.mark_invalid(id, reason)
        }
        fn delete(&self, id: &str) -> Result<bool> {
            self.inner.delete(id)
        }
    }

    #[tokio::test]
    async fn slow_store_writes_do_not_hold_up_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        for name in ["a", "b"] {
            std::fs::write(uploads.join(format!("{}.pdf", name)), b"%PDF").unwrap();
        }
        let store = Arc::new(GatedStore {
            gate: std::sync::RwLock::new(()),
            inner: MemoryStore::new(),
        });
        let runner = Arc::new(GatedRunner::default());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_concurrent: 1,
                uploads_dir: uploads,
                outputs_dir: dir.path().join("outputs"),
            },
            store.clone(),
            Arc::new(EventHub::new()),
            Arc::new(runner.clone()),
        );

        let closed = store.gate.write().unwrap();
        let busy = scheduler.clone();
        let work = tokio::task::spawn_blocking(move || {
            let a = busy
                .submit(JobConfig::new("a", "en", "fr"), at(0), None)
                .unwrap();
            let b = busy
                .submit(JobConfig::new("b", "en", "fr"), at(1), None)
                .unwrap();
            assert!(busy.cancel(&b.job_id));
            let a_status = busy.status(&a.job_id).unwrap().unwrap().job.status;
            (a, b, a_status)
        });
        let (a, b, a_status) = tokio::time::timeout(Duration::from_secs(5), work)
            .await
            .expect("scheduler blocked on the store")
            .unwrap();
        assert_eq!(a_status, JobStatus::Running);
        assert!(store.inner.get_full(&a.job_id).unwrap().is_none());

        drop(closed);
        scheduler.flush_store();
        assert_eq!(store.inner.get_full(&b.job_id).unwrap().unwrap().status, JobStatus::Cancelled);
        assert!(store.inner.get_full(&a.job_id).unwrap().is_some());
        runner.release.notify_one();
    }

    #[tokio::test]
    async fn resumes_unfinished_jobs_in_created_order() {
        let fx = fixture(1);
        for (id, file, secs, status) in [
            ("j2", "two", 20, JobStatus::Queued),
            ("j1", "one", 10, JobStatus::Running),
            ("j3", "gone", 5, JobStatus::Queued),
            ("j4", "done", 1, JobStatus::Completed),
        ] {
            if file != "gone" {
                std::fs::write(fx.uploads.join(format!("{}.pdf", file)), b"%PDF").unwrap();
            }
            let mut job = Job::new(id.into(), JobConfig::new(file, "en", "fr"), at(secs), "t".into());
            job.status = status;
            fx.store.upsert(&job).unwrap();
        }

        let report = fx.scheduler.resume_from_store().unwrap();
        assert_eq!(
            report,
            ResumeReport {
                running: 1,
                queued: 1,
                invalid: 1,
            }
        );
        assert_eq!(fx.job("j1").status, JobStatus::Running);
        assert_eq!(fx.scheduler.queue_position("j2"), Some(1));
        assert_eq!(fx.job("j3").status, JobStatus::Invalid);
        assert_eq!(fx.job("j4").status, JobStatus::Completed);

        let listed: Vec<String> = fx.scheduler.list().unwrap().into_iter().map(|v| v.job.id).collect();
        assert_eq!(listed, ["j2", "j1", "j3", "j4"]);
        fx.release_one().await;
        fx.release_one().await;
    }
}
