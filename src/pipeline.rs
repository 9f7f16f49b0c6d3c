//! One job end to end: extract → fetch + normalize (fan-out) → deliver.

use crate::{
    chat::{ChatChannel, MessageRef},
    dedup::JobSlot,
    delivery::DeliveryManager,
    extract::{ExtractionError, ExtractionWorker},
    fetch::ImageFetcher,
    jobs::{ExtractionJob, JobRecorder, JobState},
    normalize,
    profile::PrincipalDirectory,
    stats::UsageStats,
};
use futures::future::join_all;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{error, info, warn};

pub const MSG_COLLECTING: &str = "Збираю зображення, зачекайте…";
pub const MSG_NOT_FOUND: &str = "❌ Не вдалося знайти зображення для цього посилання.";
pub const MSG_NOT_DELIVERED: &str = "❌ Не вдалося надіслати зображення. Спробуйте /retry.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("none of {0} images could be fetched")]
    NoAssets(usize),
    #[error("none of {0} images were delivered")]
    NothingDelivered(usize),
    #[error("work directory: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Extraction(_) => "extract",
            PipelineError::NoAssets(_) | PipelineError::Io(_) => "fetch",
            PipelineError::NothingDelivered(_) => "deliver",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            PipelineError::NothingDelivered(_) => MSG_NOT_DELIVERED,
            _ => MSG_NOT_FOUND,
        }
    }
}

pub struct PipelineOrchestrator {
    extractor: Arc<ExtractionWorker>,
    fetcher: Arc<ImageFetcher>,
    delivery: Arc<DeliveryManager>,
    chat: Arc<dyn ChatChannel>,
    directory: PrincipalDirectory,
    stats: UsageStats,
    recorder: JobRecorder,
    work_dir: PathBuf,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<ExtractionWorker>,
        fetcher: Arc<ImageFetcher>,
        delivery: Arc<DeliveryManager>,
        chat: Arc<dyn ChatChannel>,
        directory: PrincipalDirectory,
        stats: UsageStats,
        recorder: JobRecorder,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            extractor,
            fetcher,
            delivery,
            chat,
            directory,
            stats,
            recorder,
            work_dir,
        }
    }

    /// Runs the job to a terminal state. The single-flight slot is held for
    /// the whole run and released when it drops, whatever the outcome.
    pub async fn run(&self, mut job: ExtractionJob, slot: JobSlot) -> JobState {
        let started = Instant::now();
        info!(
            target = "listing_bot.pipeline",
            job = %job.id,
            principal = slot.principal(),
            url = %job.url,
            crop = job.crop_percent,
            "job_started"
        );
        self.recorder.record(&job).await;
        let status = match self.chat.send_text(job.chat, MSG_COLLECTING, None).await {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(target = "listing_bot.pipeline", job = %job.id, error = %err, "status message failed");
                None
            }
        };

        let job_dir = self.work_dir.join(format!("{}_{}", job.principal, job.id.simple()));
        let outcome = self.execute(&mut job, &job_dir).await;

        let terminal = match outcome {
            Ok(delivered) => {
                self.on_success(&job, delivered, status).await;
                JobState::Completed { delivered }
            }
            Err(err) => {
                error!(
                    target = "listing_bot.pipeline",
                    job = %job.id,
                    stage = err.stage(),
                    error = %err,
                    "job_failed"
                );
                self.notify(status, &job, err.user_message()).await;
                JobState::Failed {
                    error: err.to_string(),
                    stage: err.stage().to_string(),
                }
            }
        };
        job.advance(terminal);
        self.recorder.record(&job).await;

        cleanup(&job_dir).await;
        self.recorder.discard(&job).await;
        let finished = job.state().clone();
        crate::metrics::inc_jobs(if matches!(finished, JobState::Completed { .. }) {
            "completed"
        } else {
            "failed"
        });
        crate::metrics::stage_elapsed("job", started.elapsed().as_millis());
        drop(slot);
        finished
    }

    async fn execute(&self, job: &mut ExtractionJob, job_dir: &Path) -> Result<usize, PipelineError> {
        job.advance(JobState::Extracting);
        self.recorder.record(job).await;
        let extraction = self.extractor.extract(&job.url).await?;
        info!(
            target = "listing_bot.pipeline",
            job = %job.id,
            strategy = extraction.strategy,
            recovered = extraction.recovered,
            count = extraction.references.len(),
            "images_discovered"
        );

        tokio::fs::create_dir_all(job_dir).await?;
        let crop = job.crop_percent;
        let started = Instant::now();
        let prepared = join_all(
            extraction
                .references
                .iter()
                .enumerate()
                .map(|(index, reference)| self.prepare(index, reference, job_dir, crop)),
        )
        .await;
        crate::metrics::stage_elapsed("fetch_normalize", started.elapsed().as_millis());
        let assets: Vec<PathBuf> = prepared.into_iter().flatten().collect();
        if assets.is_empty() {
            return Err(PipelineError::NoAssets(extraction.references.len()));
        }

        job.advance(JobState::Delivering {
            images: assets.len(),
        });
        self.recorder.record(job).await;
        let started = Instant::now();
        let delivered = self.delivery.deliver(job.chat, &assets).await;
        crate::metrics::stage_elapsed("deliver", started.elapsed().as_millis());
        if delivered == 0 {
            return Err(PipelineError::NothingDelivered(assets.len()));
        }
        Ok(delivered)
    }

    /// Fetches one reference and returns its canonical asset: the cropped
    /// file when normalization produced one, otherwise the raw file.
    async fn prepare(&self, index: usize, reference: &str, dir: &Path, percent: u8) -> Option<PathBuf> {
        let bytes = self.fetcher.fetch(reference).await;
        if bytes.is_empty() {
            return None;
        }
        let raw = match normalize::store_raw(bytes, &dir.join(format!("raw_image_{index}.png"))).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "listing_bot.pipeline", index, reference, error = %err, "undecodable image skipped");
                return None;
            }
        };
        let cropped = dir.join(format!("cropped_image_{index}.png"));
        match normalize::crop(&raw, &cropped, percent).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(target = "listing_bot.pipeline", index, error = %err, "crop failed; sending raw image");
                Some(raw)
            }
        }
    }

    async fn on_success(&self, job: &ExtractionJob, delivered: usize, status: Option<MessageRef>) {
        if let Err(err) = self.stats.increment(job.principal).await {
            warn!(target = "listing_bot.pipeline", job = %job.id, error = %err, "usage counter not updated");
        }
        self.notify(status, job, &format!("✅ Готово. Надіслано {delivered} зображень."))
            .await;

        let mut profile = match self.directory.load_profile(job.principal).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(target = "listing_bot.pipeline", job = %job.id, error = %err, "profile not updated");
                return;
            }
        };
        profile.last_url = Some(job.url.clone());
        profile.last_images_count = Some(delivered);
        profile.last_processed_time = Some(chrono::Utc::now().timestamp());
        profile.crop_percentage = Some(job.crop_percent);
        if let Err(err) = self.directory.save_profile(job.principal, &profile).await {
            warn!(target = "listing_bot.pipeline", job = %job.id, error = %err, "profile not updated");
        }
        info!(target = "listing_bot.pipeline", job = %job.id, delivered, "job_completed");
    }

    async fn notify(&self, status: Option<MessageRef>, job: &ExtractionJob, text: &str) {
        let sent = match status {
            Some(message) => self.chat.edit_text(message, text, None).await,
            None => self.chat.send_text(job.chat, text, None).await.map(|_| ()),
        };
        if let Err(err) = sent {
            warn!(target = "listing_bot.pipeline", job = %job.id, error = %err, "status update failed");
        }
    }
}

async fn cleanup(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(target = "listing_bot.pipeline", dir = %dir.display(), error = %err, "asset cleanup failed"),
    }
}
