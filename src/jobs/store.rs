use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use time::OffsetDateTime;

use super::model::{Job, JobStatus};

/// Durable job records. Implementations must be safe to call from any thread.
pub trait JobStore: Send + Sync {
    fn upsert(&self, job: &Job) -> Result<()>;
    fn list(&self) -> Result<Vec<Job>>;
    fn get_full(&self, id: &str) -> Result<Option<Job>>;
    /// Returns false when the job is unknown or already invalid.
    fn mark_invalid(&self, id: &str, reason: &str) -> Result<bool>;
    fn delete(&self, id: &str) -> Result<bool>;
}

fn invalidate(job: &mut Job, reason: &str) -> bool {
    if job.status == JobStatus::Invalid {
        return false;
    }
    job.status = JobStatus::Invalid;
    job.stage = "invalid".to_string();
    job.error = Some(reason.to_string());
    job.message = Some(reason.to_string());
    job.end_time = Some(OffsetDateTime::now_utc());
    true
}

/// One pretty-printed `<id>.json` per job under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create job directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(path: &Path) -> Result<Job> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read job: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse job: {}", path.display()))
    }
}

impl JobStore for JsonFileStore {
    fn upsert(&self, job: &Job) -> Result<()> {
        let content = serde_json::to_vec_pretty(job)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp file in {}", self.dir.display()))?;
        tmp.write_all(&content)?;
        let path = self.path_for(&job.id);
        tmp.persist(&path)
            .with_context(|| format!("failed to write job: {}", path.display()))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list jobs in {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(job) => jobs.push(job),
                Err(err) => tracing::warn!("skipping unreadable job record: {:#}", err),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn get_full(&self, id: &str) -> Result<Option<Job>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn mark_invalid(&self, id: &str, reason: &str) -> Result<bool> {
        let Some(mut job) = self.get_full(id)? else {
            return Ok(false);
        };
        if !invalidate(&mut job, reason) {
            return Ok(false);
        }
        self.upsert(&job)?;
        Ok(true)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete job: {}", path.display()))?;
        Ok(true)
    }
}

/// In-process store, for tests and single-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn upsert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by_key(|job| job.created_at);
        Ok(list)
    }

    fn get_full(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(id).cloned())
    }

    fn mark_invalid(&self, id: &str, reason: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get_mut(id).is_some_and(|job| invalidate(job, reason)))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobConfig;

    fn job(id: &str, secs: i64) -> Job {
        Job::new(
            id.to_string(),
            JobConfig::new("file", "en", "fr"),
            OffsetDateTime::from_unix_timestamp(secs).unwrap(),
            "token".to_string(),
        )
    }

    fn exercise(store: &dyn JobStore) {
        store.upsert(&job("b", 20)).unwrap();
        store.upsert(&job("a", 10)).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, ["a", "b"]);

        assert!(store.mark_invalid("a", "source file missing").unwrap());
        assert!(!store.mark_invalid("a", "again").unwrap());
        assert!(!store.mark_invalid("zzz", "nope").unwrap());
        let a = store.get_full("a").unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Invalid);
        assert_eq!(a.error.as_deref(), Some("source file missing"));

        assert!(store.delete("b").unwrap());
        assert!(!store.delete("b").unwrap());
        assert!(store.get_full("b").unwrap().is_none());
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn json_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("jobs")).unwrap();
        exercise(&store);
        let reopened = JsonFileStore::open(dir.path().join("jobs")).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
