use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

use super::model::JobResult;

const CHANNEL_CAPACITY: usize = 64;

/// Event emitted while a job runs. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    ProgressUpdate {
        overall_progress: f32,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Finish {
        translate_result: JobResult,
    },
    Error {
        error: String,
    },
}

impl JobEvent {
    pub fn progress(overall_progress: f32, stage: impl Into<String>) -> Self {
        JobEvent::ProgressUpdate {
            overall_progress,
            stage: stage.into(),
            message: None,
        }
    }

    pub fn progress_with_message(
        overall_progress: f32,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        JobEvent::ProgressUpdate {
            overall_progress,
            stage: stage.into(),
            message: Some(message.into()),
        }
    }

    /// Clamps progress into `[0, 100]` and names an empty stage `processing`.
    pub fn normalized(self) -> Self {
        match self {
            JobEvent::ProgressUpdate {
                overall_progress,
                stage,
                message,
            } => {
                let overall_progress = if overall_progress.is_nan() {
                    0.0
                } else {
                    overall_progress.clamp(0.0, 100.0)
                };
                let stage = if stage.trim().is_empty() {
                    "processing".to_string()
                } else {
                    stage
                };
                JobEvent::ProgressUpdate {
                    overall_progress,
                    stage,
                    message,
                }
            }
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::ProgressUpdate { .. })
    }
}

/// Receives every event for every job.
pub trait EventSink: Send + Sync {
    fn publish(&self, job_id: &str, event: JobEvent);
}

#[derive(Default)]
struct HubState {
    latest: HashMap<String, JobEvent>,
    channels: HashMap<String, broadcast::Sender<JobEvent>>,
}

/// Keeps the latest event per live job and fans events out to subscribers.
///
/// A job's entries go away with its terminal event (or `forget`), and a channel
/// goes away as soon as it has no receivers, so the hub only grows with the
/// jobs that are still running.
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, job_id: &str) -> Option<JobEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.latest.get(job_id).cloned()
    }

    /// Latest event so far plus a receiver for everything after it.
    pub fn subscribe(&self, job_id: &str) -> (Option<JobEvent>, broadcast::Receiver<JobEvent>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = state.latest.get(job_id).cloned();
        state.channels.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = state
            .channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        (snapshot, receiver)
    }

    /// Drops `receiver` and the job's channel if nobody else listens on it.
    pub fn unsubscribe(&self, job_id: &str, receiver: broadcast::Receiver<JobEvent>) {
        drop(receiver);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .channels
            .get(job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            state.channels.remove(job_id);
        }
    }

    /// Drops everything kept for the job. Current subscribers still receive
    /// what was already sent, then see the channel close.
    pub fn forget(&self, job_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.latest.remove(job_id);
        state.channels.remove(job_id);
    }

    /// Number of jobs with a kept event and number of open channels.
    pub fn tracked(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.latest.len(), state.channels.len())
    }
}

impl EventSink for EventHub {
    fn publish(&self, job_id: &str, event: JobEvent) {
        let event = event.normalized();
        let terminal = event.is_terminal();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = match state.channels.get(job_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => false,
        };
        if terminal {
            state.latest.remove(job_id);
            state.channels.remove(job_id);
            return;
        }
        if !delivered && state.channels.remove(job_id).is_some() {
            tracing::trace!("no live subscribers for job {}", job_id);
        }
        state.latest.insert(job_id.to_string(), event);
    }
}
