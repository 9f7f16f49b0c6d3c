//! Fakes shared by the pipeline and dispatcher tests.

use crate::{
    automation::{Automation, AutomationError, BrowserSession, ElementRef, Locator},
    chat::fake::FakeChat,
    delivery::{DeliveryManager, TimeoutLadder},
    extract::{ExtractionSettings, ExtractionWorker},
    fetch::{FetchError, ImageFetcher, ImageSource},
    jobs::JobRecorder,
    pipeline::PipelineOrchestrator,
    profile::PrincipalDirectory,
    ratelimit::RateLimiter,
    retry::RetryPolicy,
    stats::UsageStats,
    store::memory::MemoryStore,
};
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, path::Path, sync::Arc, time::Duration};

pub const GALLERY: &str = "[data-testid='ad-photo'] img";
pub const OLX_URL: &str = "https://www.olx.ua/d/uk/obyavlenie/kvartira-IDxyz.html";

/// Every session shows the same OLX gallery of `count` photos.
pub struct Gallery {
    pub count: usize,
}

#[async_trait]
impl Automation for Gallery {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, AutomationError> {
        Ok(Box::new(GallerySession { count: self.count }))
    }

    async fn status(&self) -> bool {
        true
    }
}

struct GallerySession {
    count: usize,
}

#[async_trait]
impl BrowserSession for GallerySession {
    async fn set_page_load_timeout(&self, _timeout: Duration) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn navigate(&self, _url: &str) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, AutomationError> {
        Ok(match locator {
            Locator::Css(css) if css == GALLERY => {
                (0..self.count).map(|i| ElementRef(i.to_string())).collect()
            }
            _ => Vec::new(),
        })
    }

    async fn find_within(
        &self,
        _parent: &ElementRef,
        _locator: &Locator,
    ) -> Result<Vec<ElementRef>, AutomationError> {
        Ok(Vec::new())
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, AutomationError> {
        Ok((name == "src").then(|| format!("https://cdn.example.com/photo-{}.jpg", element.0)))
    }

    async fn click(&self, _element: &ElementRef) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        Ok(())
    }
}

/// Serves a 10x20 PNG for every photo except `photo-1`, which always times out.
pub struct PngSource;

#[async_trait]
impl ImageSource for PngSource {
    async fn download(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        if url.contains("photo-1.") {
            return Err(FetchError::Timeout);
        }
        let img = RgbImage::from_pixel(10, 20, Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(out.into_inner())
    }
}

/// Orchestrator over fakes with short, real-clock retry delays.
pub fn orchestrator(
    photos: usize,
    chat: Arc<FakeChat>,
    store: Arc<MemoryStore>,
    work_dir: &Path,
) -> PipelineOrchestrator {
    let extractor = ExtractionWorker::new(
        Arc::new(Gallery { count: photos }),
        2,
        RetryPolicy::linear(2, Duration::from_millis(10)),
        ExtractionSettings {
            page_load_timeout: Duration::from_secs(15),
            element_wait: Duration::ZERO,
            overlay_wait: Duration::from_millis(10),
        },
    );
    let fetcher = ImageFetcher::new(
        Arc::new(PngSource),
        Arc::new(RateLimiter::per_second(100.0)),
        RetryPolicy::linear(1, Duration::from_millis(10)),
        Duration::from_secs(5),
    );
    let delivery = DeliveryManager::new(
        chat.clone(),
        10,
        RetryPolicy::fixed(2, Duration::from_millis(10)),
        RetryPolicy::fixed(1, Duration::from_millis(10)),
        TimeoutLadder {
            base: Duration::from_secs(60),
            step: Duration::from_secs(30),
            ceiling: Duration::from_secs(180),
        },
    );
    PipelineOrchestrator::new(
        Arc::new(extractor),
        Arc::new(fetcher),
        Arc::new(delivery),
        chat,
        PrincipalDirectory::new(store.clone()),
        UsageStats::new(store.clone()),
        JobRecorder::new(store),
        work_dir.to_path_buf(),
    )
}
