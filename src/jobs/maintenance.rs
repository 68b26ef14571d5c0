use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use super::model::{Job, JobStatus};
use super::scheduler::Scheduler;

const MISSING_SOURCE: &str = "source file is missing; job invalidated";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub deleted_orphans: usize,
    pub invalid_jobs: usize,
    pub fixed_completed: usize,
}

impl Scheduler {
    /// Reconciles stored jobs with the files on disk. Jobs this process is
    /// running are left alone.
    ///
    /// Repairing a `running` job to `completed` is best effort: the only
    /// evidence is its progress and a mono PDF in its output directory.
    pub fn run_maintenance(&self, delete_orphans: bool) -> Result<MaintenanceReport> {
        self.flush_store();
        let mut jobs: HashMap<String, Job> = self
            .inner
            .store
            .list()?
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        let live: HashSet<String> = {
            let state = self.lock();
            for (id, job) in &state.jobs {
                jobs.insert(id.clone(), job.clone());
            }
            state.running.keys().cloned().collect()
        };

        let mut report = MaintenanceReport::default();
        if delete_orphans {
            let referenced: HashSet<&str> = jobs.values().map(|job| job.config.file_id.as_str()).collect();
            report.deleted_orphans = delete_orphan_uploads(&self.inner.config.uploads_dir, &referenced)?;
        }

        for job in jobs.values() {
            if live.contains(&job.id) || job.status == JobStatus::Invalid {
                continue;
            }
            if !self.source_path(&job.config).exists() {
                if self.inner.store.mark_invalid(&job.id, MISSING_SOURCE)? {
                    report.invalid_jobs += 1;
                }
                self.invalidate_in_memory(&job.id);
                continue;
            }
            if job.status == JobStatus::Running
                && job.progress >= 100.0
                && has_mono_output(&self.output_dir(&job.id), &job.config.file_id)
            {
                let mut fixed = job.clone();
                fixed.status = JobStatus::Completed;
                fixed.stage = "completed".to_string();
                fixed.progress = 100.0;
                fixed.end_time = Some(OffsetDateTime::now_utc());
                let mut state = self.lock();
                if let Some(memory) = state.jobs.get_mut(&job.id) {
                    *memory = fixed.clone();
                }
                self.persist(&fixed);
                drop(state);
                report.fixed_completed += 1;
            }
        }

        self.flush_store();
        tracing::info!(
            "maintenance: deleted_orphans={}, invalid_jobs={}, fixed_completed={}",
            report.deleted_orphans,
            report.invalid_jobs,
            report.fixed_completed
        );
        Ok(report)
    }

    fn invalidate_in_memory(&self, job_id: &str) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Invalid;
        job.stage = "invalid".to_string();
        job.error = Some(MISSING_SOURCE.to_string());
        job.end_time = Some(OffsetDateTime::now_utc());
        self.persist(job);
        if self.remove_from_queue_locked(&mut state, job_id) {
            tracing::info!("job {} dropped from the queue: source missing", job_id);
        }
    }

    /// Runs maintenance every `interval`, skipping the immediate first tick.
    pub fn spawn_maintenance(&self, interval: Duration, delete_orphans: bool) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sweep = scheduler.clone();
                match tokio::task::spawn_blocking(move || sweep.run_maintenance(delete_orphans)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!("maintenance failed: {:#}", err),
                    Err(err) => tracing::warn!("maintenance panicked: {}", err),
                }
            }
        })
    }
}

fn delete_orphan_uploads(uploads: &Path, referenced: &HashSet<&str>) -> Result<usize> {
    if !uploads.exists() {
        return Ok(0);
    }
    let mut deleted = 0;
    let entries =
        fs::read_dir(uploads).with_context(|| format!("failed to list uploads in {}", uploads.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("pdf") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if referenced.contains(stem) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(err) => tracing::warn!("failed to delete orphan {}: {}", path.display(), err),
        }
    }
    Ok(deleted)
}

fn has_mono_output(dir: &Path, file_id: &str) -> bool {
    let prefix = format!("{}.", file_id);
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".mono.pdf"))
    })
}
