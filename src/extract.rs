//! Photo discovery on listing pages through the automation service.
//!
//! Each attempt opens one session, loads the page, tries to dismiss the
//! consent overlay, then walks a site-specific cascade of gallery strategies.
//! When none of them yield anything, every `<img>` on the page is scanned and
//! filtered to the listing CDNs.

use crate::{
    automation::{Automation, AutomationError, BrowserSession, ElementRef, Locator},
    http::host_allowed,
    retry::{RetryPolicy, Verdict},
};
use reqwest::Url;
use std::{collections::HashSet, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info, warn};

/// Hosts photos may come from when the generic scan is used.
pub const CONTENT_CDN_ALLOWLIST: &[&str] = &["olxcdn.com", "otodom.pl", "otodompl.imgix.net"];

const CONSENT_XPATHS: &[&str] = &[
    "//div[contains(text(),'Прийняти всі')]",
    "//button[@id='onetrust-accept-btn-handler']",
];
const SRC_ATTRIBUTES: &[&str] = &["src", "data-src"];
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported listing site: {0}")]
    UnsupportedSite(String),
    #[error("no images found")]
    NoImages,
    #[error(transparent)]
    Automation(#[from] AutomationError),
    #[error("automation pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Olx,
    Otodom,
}

impl Site {
    pub fn detect(url: &str) -> Option<Site> {
        let parsed = Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = parsed.host_str()?.to_lowercase();
        if host.contains("otodom") {
            Some(Site::Otodom)
        } else if host.contains("olx") {
            Some(Site::Olx)
        } else {
            None
        }
    }

    fn strategies(&self) -> &'static [Strategy] {
        match self {
            Site::Otodom => OTODOM_STRATEGIES,
            Site::Olx => OLX_STRATEGIES,
        }
    }
}

/// One selector variant: an optional container, then images inside it.
#[derive(Debug)]
pub struct Strategy {
    pub name: &'static str,
    pub container: Option<&'static str>,
    pub image: &'static str,
}

const OTODOM_STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "otodom_carousel",
        container: Some("[data-testid='carousel-container']"),
        image: "img",
    },
    Strategy {
        name: "otodom_mosaic",
        container: None,
        image: "[data-cy='mosaic-gallery-main-view'] img",
    },
    Strategy {
        name: "otodom_picture",
        container: None,
        image: "[data-testid='ad-gallery'] picture img",
    },
];

const OLX_STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "olx_swiper",
        container: Some(".swiper-slide"),
        image: "img",
    },
    Strategy {
        name: "olx_photo_testid",
        container: None,
        image: "[data-testid='ad-photo'] img",
    },
    Strategy {
        name: "olx_swiper_slide_cy",
        container: None,
        image: "[data-cy='adPhotos-swiperSlide'] img",
    },
];

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub page_load_timeout: Duration,
    pub element_wait: Duration,
    pub overlay_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub references: Vec<String>,
    pub strategy: &'static str,
    /// A strategy other than the first one produced the references.
    pub recovered: bool,
}

pub struct ExtractionWorker {
    automation: Arc<dyn Automation>,
    pool: Arc<Semaphore>,
    policy: RetryPolicy,
    settings: ExtractionSettings,
}

impl ExtractionWorker {
    pub fn new(
        automation: Arc<dyn Automation>,
        concurrency: usize,
        policy: RetryPolicy,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            automation,
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
            policy,
            settings,
        }
    }

    pub async fn extract(&self, url: &str) -> Result<Extraction, ExtractionError> {
        let site =
            Site::detect(url).ok_or_else(|| ExtractionError::UnsupportedSite(url.to_string()))?;
        let started = Instant::now();
        let result = self
            .policy
            .run(
                "extract_images",
                |attempt| self.attempt(url, site, attempt),
                |err| match err {
                    ExtractionError::UnsupportedSite(_) | ExtractionError::PoolClosed => {
                        Verdict::GiveUp
                    }
                    _ => Verdict::Retry,
                },
            )
            .await;
        crate::metrics::stage_elapsed("extract", started.elapsed().as_millis());
        result
    }

    async fn attempt(
        &self,
        url: &str,
        site: Site,
        attempt: u32,
    ) -> Result<Extraction, ExtractionError> {
        // One slot per attempt; backoff sleeps hold none.
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ExtractionError::PoolClosed)?;
        let mut session = self.automation.open().await?;
        let outcome = self.scrape(session.as_ref(), url, site).await;
        if let Err(err) = session.close().await {
            warn!(target = "listing_bot.extract", attempt, error = %err, "session_close_failed");
        }
        let extraction = outcome?;
        if extraction.references.is_empty() {
            return Err(ExtractionError::NoImages);
        }
        Ok(extraction)
    }

    async fn scrape(
        &self,
        session: &dyn BrowserSession,
        url: &str,
        site: Site,
    ) -> Result<Extraction, ExtractionError> {
        session
            .set_page_load_timeout(self.settings.page_load_timeout)
            .await?;
        session.navigate(url).await?;
        self.dismiss_overlay(session).await;

        for (index, strategy) in site.strategies().iter().enumerate() {
            let wait = if index == 0 {
                self.settings.element_wait
            } else {
                Duration::ZERO
            };
            match run_strategy(session, strategy, wait).await {
                Ok(references) if !references.is_empty() => {
                    if index > 0 {
                        info!(
                            target = "listing_bot.extract",
                            strategy = strategy.name,
                            count = references.len(),
                            "extraction recovered via fallback strategy"
                        );
                    }
                    return Ok(Extraction {
                        references,
                        strategy: strategy.name,
                        recovered: index > 0,
                    });
                }
                Ok(_) => debug!(target = "listing_bot.extract", strategy = strategy.name, "strategy_empty"),
                Err(err) => debug!(target = "listing_bot.extract", strategy = strategy.name, error = %err, "strategy_failed"),
            }
        }

        let references = generic_scan(session).await?;
        if !references.is_empty() {
            info!(
                target = "listing_bot.extract",
                count = references.len(),
                "extraction recovered via generic image scan"
            );
        }
        Ok(Extraction {
            references,
            strategy: "generic_scan",
            recovered: true,
        })
    }

    /// Consent overlays are optional; nothing here can fail the attempt.
    async fn dismiss_overlay(&self, session: &dyn BrowserSession) {
        let deadline = self.settings.overlay_wait;
        let dismissed = timeout(deadline, async {
            loop {
                for xpath in CONSENT_XPATHS {
                    if let Ok(found) = session.find_all(&Locator::xpath(xpath)).await
                        && let Some(button) = found.first()
                    {
                        return session.click(button).await.is_ok();
                    }
                }
                sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        if let Ok(clicked) = dismissed {
            debug!(target = "listing_bot.extract", clicked, "consent_overlay_handled");
        }
    }
}

async fn run_strategy(
    session: &dyn BrowserSession,
    strategy: &Strategy,
    wait: Duration,
) -> Result<Vec<String>, AutomationError> {
    let anchor = Locator::css(strategy.container.unwrap_or(strategy.image));
    let anchors = wait_for(session, &anchor, wait).await?;
    if anchors.is_empty() {
        return Ok(Vec::new());
    }

    let images = match strategy.container {
        Some(_) => {
            let mut images = Vec::new();
            for container in &anchors {
                match session
                    .find_within(container, &Locator::css(strategy.image))
                    .await
                {
                    Ok(found) => images.extend(found),
                    Err(err) => debug!(target = "listing_bot.extract", error = %err, "container_without_image"),
                }
            }
            images
        }
        None => anchors,
    };

    let mut references = Vec::with_capacity(images.len());
    for image in &images {
        if let Some(src) = image_source(session, image).await {
            references.push(trim_size_suffix(&src));
        }
    }
    Ok(deduplicate(references))
}

async fn generic_scan(session: &dyn BrowserSession) -> Result<Vec<String>, AutomationError> {
    let images = session.find_all(&Locator::css("img")).await?;
    let mut references = Vec::new();
    for image in &images {
        let Some(src) = image_source(session, image).await else {
            continue;
        };
        let allowed = Url::parse(&src)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|h| host_allowed(h, CONTENT_CDN_ALLOWLIST)))
            .unwrap_or(false);
        if allowed {
            references.push(trim_size_suffix(&src));
        }
    }
    Ok(deduplicate(references))
}

async fn wait_for(
    session: &dyn BrowserSession,
    locator: &Locator,
    wait: Duration,
) -> Result<Vec<ElementRef>, AutomationError> {
    let deadline = Instant::now() + wait;
    loop {
        let found = session.find_all(locator).await?;
        if !found.is_empty() || Instant::now() >= deadline {
            return Ok(found);
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn image_source(session: &dyn BrowserSession, image: &ElementRef) -> Option<String> {
    for attr in SRC_ATTRIBUTES {
        if let Ok(Some(value)) = session.attribute(image, attr).await
            && value.starts_with("http")
        {
            return Some(value);
        }
    }
    None
}

/// Gallery thumbnails carry `/image;s=WxH` sizing; keep the bare `/image;` form.
fn trim_size_suffix(src: &str) -> String {
    match src.find("/image;") {
        Some(idx) => format!("{}/image;", &src[..idx]),
        None => src.to_string(),
    }
}

fn deduplicate(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
