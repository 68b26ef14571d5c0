use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use super::model::Job;
use super::store::JobStore;

enum Op {
    Upsert(Job),
    Delete(String, Sender<Result<bool>>),
    Flush(Sender<()>),
}

/// Applies store writes on a dedicated thread, in the order they were sent.
///
/// Sending never blocks, so callers may hold the scheduler lock while they
/// enqueue a snapshot. Snapshots of one job that queue up together collapse
/// into the last one.
pub(super) struct StoreWriter {
    tx: Sender<Op>,
}

impl StoreWriter {
    pub(super) fn spawn(store: Arc<dyn JobStore>) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("job-store-writer".to_string())
            .spawn(move || write_loop(store.as_ref(), rx))
            .map(|_| ())
            .unwrap_or_else(|err| tracing::error!("failed to start job store writer: {}", err));
        Self { tx }
    }

    pub(super) fn upsert(&self, job: Job) {
        if self.tx.send(Op::Upsert(job)).is_err() {
            tracing::warn!("job store writer is gone; dropping a job update");
        }
    }

    /// Deletes after every write sent before it.
    pub(super) async fn delete(&self, id: &str) -> Result<bool> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Op::Delete(id.to_string(), reply_tx))
            .map_err(|_| anyhow!("job store writer is gone"))?;
        tokio::task::spawn_blocking(move || reply_rx.recv())
            .await
            .map_err(|err| anyhow!("waiting for job store writer failed: {}", err))?
            .map_err(|_| anyhow!("job store writer stopped before deleting"))?
    }

    /// Blocks until every write sent so far has reached the store.
    pub(super) fn flush(&self) {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(Op::Flush(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }
}

fn write_loop(store: &dyn JobStore, rx: Receiver<Op>) {
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        batch.extend(rx.try_iter());

        let superseded = superseded_upserts(&batch);
        for (op, skip) in batch.into_iter().zip(superseded) {
            match op {
                Op::Upsert(job) if skip => drop(job),
                Op::Upsert(job) => {
                    if let Err(err) = store.upsert(&job) {
                        tracing::warn!("failed to persist job {}: {:#}", job.id, err);
                    }
                }
                Op::Delete(id, reply) => {
                    let _ = reply.send(store.delete(&id));
                }
                Op::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    }
}

/// Marks upserts that a later upsert of the same job replaces within the batch.
fn superseded_upserts(batch: &[Op]) -> Vec<bool> {
    let mut newer: HashSet<&str> = HashSet::new();
    let mut skip = vec![false; batch.len()];
    for (i, op) in batch.iter().enumerate().rev() {
        match op {
            Op::Upsert(job) => skip[i] = !newer.insert(job.id.as_str()),
            Op::Delete(id, _) => {
                newer.remove(id.as_str());
            }
            Op::Flush(_) => {}
        }
    }
    skip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobConfig, JobStatus, MemoryStore};
    use time::OffsetDateTime;

    fn job(id: &str, stage: &str) -> Job {
        let mut job = Job::new(
            id.to_string(),
            JobConfig::new("f", "en", "de"),
            OffsetDateTime::UNIX_EPOCH,
            String::new(),
        );
        job.stage = stage.to_string();
        job
    }

    #[test]
    fn later_snapshots_win() {
        let store = Arc::new(MemoryStore::new());
        let writer = StoreWriter::spawn(store.clone());
        for stage in ["queued", "starting", "translating page 1/2"] {
            writer.upsert(job("a", stage));
        }
        let mut done = job("a", "completed");
        done.status = JobStatus::Completed;
        writer.upsert(done);
        writer.flush();

        let stored = store.get_full("a").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.stage, "completed");
    }

    #[tokio::test]
    async fn delete_runs_after_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        let writer = StoreWriter::spawn(store.clone());
        writer.upsert(job("a", "queued"));
        writer.upsert(job("b", "queued"));
        assert!(writer.delete("a").await.unwrap());
        writer.flush();

        assert!(store.get_full("a").unwrap().is_none());
        assert!(store.get_full("b").unwrap().is_some());
    }
}
