use anyhow::Result;
use pdf_translator_rust::jobs::{
    Admission, EventHub, JobContext, JobEvent, JobFuture, JobResult, JobRunner, JobStatus,
    JobConfig, MemoryStore, Scheduler, SchedulerConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;

/// Finishes a job each time a permit is added.
struct PermitRunner {
    permits: Arc<Semaphore>,
}

impl JobRunner for PermitRunner {
    fn run(&self, ctx: JobContext) -> JobFuture {
        let permits = self.permits.clone();
        Box::pin(async move {
            ctx.progress.report(10.0, "translating page 1/1");
            let permit = permits.acquire().await?;
            permit.forget();
            Ok(JobResult {
                mono_pdf_path: Some(format!("{}.mono.pdf", ctx.config.file_id)),
                total_seconds: 0.0,
                pages: 1,
                regions_translated: 3,
            })
        })
    }
}

fn scheduler(dir: &Path, cap: usize, permits: Arc<Semaphore>) -> Result<Scheduler> {
    let uploads = dir.join("uploads");
    std::fs::create_dir_all(&uploads)?;
    for name in ["a", "b", "c"] {
        std::fs::write(uploads.join(format!("{}.pdf", name)), b"%PDF-1.4")?;
    }
    Ok(Scheduler::new(
        SchedulerConfig {
            max_concurrent: cap,
            uploads_dir: uploads,
            outputs_dir: dir.join("outputs"),
        },
        Arc::new(MemoryStore::new()),
        Arc::new(EventHub::new()),
        Arc::new(PermitRunner { permits }),
    ))
}

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_750_000_000 + secs).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn fifo_promotion_with_a_cap_of_one() {
    let dir = tempfile::tempdir().unwrap();
    let permits = Arc::new(Semaphore::new(0));
    let scheduler = scheduler(dir.path(), 1, permits.clone()).unwrap();

    let a = scheduler.submit(JobConfig::new("a", "en", "zh"), at(0), None).unwrap();
    let b = scheduler.submit(JobConfig::new("b", "en", "zh"), at(1), None).unwrap();
    assert_eq!(a.status, Admission::Running);
    assert_eq!(b.status, Admission::Queued);
    assert_eq!(scheduler.queue_position(&b.job_id), Some(1));

    let (_, mut events) = scheduler.hub().subscribe(&b.job_id);
    permits.add_permits(1);
    let finished = scheduler.wait_for(&a.job_id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.result.unwrap().regions_translated, 3);

    settle().await;
    let b_view = scheduler.status(&b.job_id).unwrap().unwrap();
    assert_eq!(b_view.job.status, JobStatus::Running);
    assert_eq!(b_view.queue_position, None);
    assert_eq!(events.recv().await.unwrap(), JobEvent::progress(0.0, "starting"));

    permits.add_permits(1);
    let finished = scheduler.wait_for(&b.job_id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn running_count_respects_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let permits = Arc::new(Semaphore::new(0));
    let scheduler = scheduler(dir.path(), 2, permits.clone()).unwrap();

    let ids: Vec<String> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            scheduler
                .submit(JobConfig::new(name, "en", "zh"), at(i as i64), None)
                .unwrap()
                .job_id
        })
        .collect();
    settle().await;
    assert_eq!(scheduler.running_count(), 2);
    assert_eq!(scheduler.queue_position(&ids[2]), Some(1));

    permits.add_permits(3);
    for id in &ids {
        let job = scheduler.wait_for(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert_eq!(scheduler.running_count(), 0);
    assert_eq!(scheduler.hub().tracked(), (0, 0));
}

#[tokio::test]
async fn cancelled_queued_job_is_never_started() {
    let dir = tempfile::tempdir().unwrap();
    let permits = Arc::new(Semaphore::new(0));
    let scheduler = scheduler(dir.path(), 1, permits.clone()).unwrap();

    let a = scheduler.submit(JobConfig::new("a", "en", "zh"), at(0), None).unwrap();
    let b = scheduler.submit(JobConfig::new("b", "en", "zh"), at(1), None).unwrap();
    assert!(scheduler.cancel(&b.job_id));

    permits.add_permits(1);
    scheduler.wait_for(&a.job_id).await.unwrap();
    settle().await;
    let b_job = scheduler.status(&b.job_id).unwrap().unwrap().job;
    assert_eq!(b_job.status, JobStatus::Cancelled);
    assert_eq!(b_job.start_time, None);
    assert_eq!(scheduler.running_count(), 0);
    assert_eq!(scheduler.hub().tracked(), (0, 0));
}
