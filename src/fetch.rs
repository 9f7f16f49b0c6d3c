use crate::{
    http::host_allowed,
    ratelimit::RateLimiter,
    retry::{RetryPolicy, Verdict},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// CDNs that serve resizable listing photos.
pub const RESIZABLE_CDN_HOSTS: &[&str] = &["olxcdn.com"];
/// Size bound requested from the CDN instead of the original upload.
pub const CDN_SIZE_VARIANT: &str = ";s=1280x1024";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Raw byte download, separated from the retry/limit policy around it.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn download(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl ImageSource for Client {
    async fn download(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url).timeout(timeout).send().await?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Rewrites a known-CDN photo URL to its bounded-size variant. Idempotent.
pub fn normalize_cdn_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return url.to_string();
    };
    if !host_allowed(host, RESIZABLE_CDN_HOSTS) {
        return url.to_string();
    }
    match url.rfind("/image") {
        Some(idx) => format!("{}/image{CDN_SIZE_VARIANT}", &url[..idx]),
        None => url.to_string(),
    }
}

pub struct ImageFetcher {
    source: Arc<dyn ImageSource>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(
        source: Arc<dyn ImageSource>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            limiter,
            policy,
            timeout,
        }
    }

    /// Empty bytes mean the image could not be fetched within the retry budget.
    pub async fn fetch(&self, url: &str) -> Vec<u8> {
        let target = normalize_cdn_url(url);
        let result = self
            .policy
            .run(
                "fetch_image",
                |_| {
                    let target = target.as_str();
                    async move {
                        self.limiter.acquire().await;
                        let bytes = self.source.download(target, self.timeout).await?;
                        if bytes.is_empty() {
                            return Err(FetchError::Transport("empty body".into()));
                        }
                        Ok(bytes)
                    }
                },
                |_| Verdict::Retry,
            )
            .await;
        crate::metrics::inc_fetch(result.is_ok());
        result.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedSource {
        script: Mutex<Vec<Result<Vec<u8>, FetchError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(mut script: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageSource for ScriptedSource {
        async fn download(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
            self.seen.lock().unwrap().push(url.to_string());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(FetchError::Status(StatusCode::NOT_FOUND)))
        }
    }

    fn fetcher(source: Arc<ScriptedSource>) -> ImageFetcher {
        ImageFetcher::new(
            source,
            Arc::new(RateLimiter::per_second(5.0)),
            RetryPolicy::linear(2, Duration::from_millis(500)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn cdn_rewrite_targets_the_last_image_segment() {
        assert_eq!(
            normalize_cdn_url("https://ireland.apollo.olxcdn.com/v1/files/imageXYZ/image;s=4000x3000"),
            "https://ireland.apollo.olxcdn.com/v1/files/imageXYZ/image;s=1280x1024"
        );
        assert_eq!(
            normalize_cdn_url("https://ireland.apollo.olxcdn.com/image/files/abc/image"),
            "https://ireland.apollo.olxcdn.com/image/files/abc/image;s=1280x1024"
        );
    }

    #[test]
    fn cdn_rewrite_is_idempotent() {
        let urls = [
            "https://ireland.apollo.olxcdn.com/v1/files/abc-UA/image;s=4000x3000",
            "https://ireland.apollo.olxcdn.com/v1/files/abc-UA/image",
            "https://ireland.apollo.olxcdn.com:443/v1/files/abc/image;s=100x100?x=1",
            "https://example.com/photo.jpg",
            "not a url",
        ];
        for url in urls {
            let once = normalize_cdn_url(url);
            assert_eq!(normalize_cdn_url(&once), once, "{url}");
        }
        assert_eq!(
            normalize_cdn_url(urls[0]),
            "https://ireland.apollo.olxcdn.com/v1/files/abc-UA/image;s=1280x1024"
        );
        assert_eq!(normalize_cdn_url(urls[3]), urls[3]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_timeouts() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::Timeout),
            Err(FetchError::Timeout),
            Ok(vec![1, 2, 3]),
        ]));
        let bytes = fetcher(source.clone()).fetch("https://example.com/a.jpg").await;
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(source.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_yields_empty_bytes() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::Status(StatusCode::BAD_GATEWAY)),
            Err(FetchError::Transport("reset".into())),
            Err(FetchError::Timeout),
            Ok(vec![9]),
        ]));
        let bytes = fetcher(source.clone()).fetch("https://example.com/a.jpg").await;
        assert!(bytes.is_empty());
        assert_eq!(source.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn requests_hit_the_rewritten_url() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![1])]));
        fetcher(source.clone())
            .fetch("https://ireland.apollo.olxcdn.com/v1/files/xyz/image;s=3000x2000")
            .await;
        assert_eq!(
            source.seen.lock().unwrap()[0],
            "https://ireland.apollo.olxcdn.com/v1/files/xyz/image;s=1280x1024"
        );
    }
}
