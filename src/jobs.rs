use crate::{
    chat::ChatId,
    store::Store,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

const SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub principal: u64,
    pub chat: ChatId,
    pub url: String,
    pub crop_percent: u8,
    pub created_at: DateTime<Utc>,
    state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Extracting,
    Delivering { images: usize },
    Completed { delivered: usize },
    Failed { error: String, stage: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Extracting => 1,
            JobState::Delivering { .. } => 2,
            JobState::Completed { .. } | JobState::Failed { .. } => 3,
        }
    }
}

impl ExtractionJob {
    pub fn new(principal: u64, chat: ChatId, url: &str, crop_percent: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            chat,
            url: url.to_string(),
            crop_percent: crop_percent.min(100),
            created_at: Utc::now(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Moves forward only; a terminal job never changes again.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            warn!(
                target = "listing_bot.jobs",
                job = %self.id,
                from = ?self.state,
                to = ?next,
                "ignored backwards job transition"
            );
            return false;
        }
        debug!(target = "listing_bot.jobs", job = %self.id, state = ?next, "job_transition");
        self.state = next;
        true
    }
}

#[derive(Serialize)]
struct JobSnapshot<'a> {
    id: String,
    principal: u64,
    url: &'a str,
    crop_percent: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    state: &'a JobState,
}

/// Best-effort persistence of the current job state for operators.
#[derive(Clone)]
pub struct JobRecorder {
    store: Arc<dyn Store>,
}

impl JobRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(principal: u64) -> String {
        format!("el_estate_bot:job:{principal}")
    }

    pub async fn record(&self, job: &ExtractionJob) {
        let snapshot = JobSnapshot {
            id: job.id.to_string(),
            principal: job.principal,
            url: &job.url,
            crop_percent: job.crop_percent,
            created_at: job.created_at,
            updated_at: Utc::now(),
            state: &job.state,
        };
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "listing_bot.jobs", job = %job.id, error = %err, "job snapshot encode failed");
                return;
            }
        };
        if let Err(err) = self
            .store
            .set_ex(&Self::key(job.principal), &raw, SNAPSHOT_TTL)
            .await
        {
            warn!(target = "listing_bot.jobs", job = %job.id, error = %err, "job snapshot write failed");
        }
    }

    pub async fn discard(&self, job: &ExtractionJob) {
        if let Err(err) = self.store.delete(&Self::key(job.principal)).await {
            warn!(target = "listing_bot.jobs", job = %job.id, error = %err, "job snapshot delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn transitions_only_move_forward() {
        let mut job = ExtractionJob::new(1, 1, "https://www.olx.ua/d/x", 15);
        assert!(job.advance(JobState::Extracting));
        assert!(!job.advance(JobState::Pending));
        assert!(job.advance(JobState::Delivering { images: 3 }));
        assert!(job.advance(JobState::Completed { delivered: 3 }));
        assert!(!job.advance(JobState::Failed {
            error: "late".into(),
            stage: "deliver".into()
        }));
        assert_eq!(job.state(), &JobState::Completed { delivered: 3 });
    }

    #[test]
    fn extracting_may_fail_directly() {
        let mut job = ExtractionJob::new(1, 1, "https://www.olx.ua/d/x", 15);
        job.advance(JobState::Extracting);
        assert!(job.advance(JobState::Failed {
            error: "no images found".into(),
            stage: "extract".into()
        }));
        assert!(job.state().is_terminal());
    }

    #[tokio::test]
    async fn snapshot_is_tagged_and_discarded() {
        let store = Arc::new(MemoryStore::default());
        let recorder = JobRecorder::new(store.clone());
        let mut job = ExtractionJob::new(9, 9, "https://www.otodom.pl/pl/oferta/x", 10);
        job.advance(JobState::Delivering { images: 4 });
        recorder.record(&job).await;

        let raw = store.get(&JobRecorder::key(9)).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["state"], "delivering");
        assert_eq!(value["images"], 4);
        assert_eq!(value["crop_percent"], 10);

        recorder.discard(&job).await;
        assert!(store.get(&JobRecorder::key(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_outage_does_not_fail_recording() {
        let store = Arc::new(MemoryStore::default());
        store.set_down(true);
        let recorder = JobRecorder::new(store);
        recorder
            .record(&ExtractionJob::new(1, 1, "https://www.olx.ua/d/x", 0))
            .await;
    }
}
