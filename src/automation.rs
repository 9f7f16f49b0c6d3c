//! Remote browser sessions over the W3C WebDriver protocol.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4d5f8ddf3b09";
/// Headroom over the page-load deadline so the remote end reports its own timeout first.
const COMMAND_HEADROOM: Duration = Duration::from_secs(30);
const WINDOW_SIZE: &str = "--window-size=412,915";
const MOBILE_USER_AGENT: &str = "user-agent=Mozilla/5.0 (Linux; Android 10; SM-G975F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Mobile Safari/537.36";

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation transport error: {0}")]
    Transport(String),
    #[error("webdriver error {error}: {message}")]
    WebDriver { error: String, message: String },
    #[error("unexpected webdriver response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for AutomationError {
    fn from(err: reqwest::Error) -> Self {
        AutomationError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(value: &str) -> Self {
        Locator::Css(value.to_string())
    }

    pub fn xpath(value: &str) -> Self {
        Locator::XPath(value.to_string())
    }

    fn strategy(&self) -> (&'static str, &str) {
        match self {
            Locator::Css(value) => ("css selector", value),
            Locator::XPath(value) => ("xpath", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Opens remote sessions; one per extraction attempt.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, AutomationError>;
    async fn status(&self) -> bool;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), AutomationError>;
    async fn navigate(&self, url: &str) -> Result<(), AutomationError>;
    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, AutomationError>;
    async fn find_within(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> Result<Vec<ElementRef>, AutomationError>;
    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, AutomationError>;
    async fn click(&self, element: &ElementRef) -> Result<(), AutomationError>;
    async fn close(&mut self) -> Result<(), AutomationError>;
}

#[derive(Clone)]
pub struct WebDriverClient {
    base_url: String,
    http: Client,
    command_timeout: Duration,
}

impl WebDriverClient {
    /// `http` should carry no global timeout; every command gets its own
    /// deadline derived from `page_load`.
    pub fn new(base_url: &str, http: Client, page_load: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            command_timeout: command_timeout(page_load),
        }
    }
}

pub fn command_timeout(page_load: Duration) -> Duration {
    page_load + COMMAND_HEADROOM
}

#[async_trait]
impl Automation for WebDriverClient {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, AutomationError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": [
                            "--headless",
                            "--no-sandbox",
                            "--disable-dev-shm-usage",
                            "--disable-gpu",
                            WINDOW_SIZE,
                            MOBILE_USER_AGENT,
                        ]
                    }
                }
            }
        });
        let value = call(
            &self.http,
            self.command_timeout,
            Method::POST,
            format!("{}/session", self.base_url),
            Some(capabilities),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AutomationError::Protocol("missing sessionId".into()))?
            .to_string();
        debug!(target = "listing_bot.automation", session = %session_id, "session_opened");
        Ok(Box::new(WebDriverSession {
            http: self.http.clone(),
            command_timeout: self.command_timeout,
            root: format!("{}/session/{}", self.base_url, session_id),
            closed: false,
        }))
    }

    async fn status(&self) -> bool {
        match self
            .http
            .get(format!("{}/status", self.base_url))
            .timeout(Duration::from_millis(1500))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// A live remote session. Dropping it without [`BrowserSession::close`]
/// still schedules a best-effort delete so the remote slot is not leaked.
pub struct WebDriverSession {
    http: Client,
    command_timeout: Duration,
    root: String,
    closed: bool,
}

impl WebDriverSession {
    fn element_url(&self, element: &ElementRef, suffix: &str) -> String {
        format!("{}/element/{}/{}", self.root, element.0, suffix)
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), AutomationError> {
        call(
            &self.http,
            self.command_timeout,
            Method::POST,
            format!("{}/timeouts", self.root),
            Some(json!({ "pageLoad": timeout.as_millis() as u64 })),
        )
        .await
        .map(|_| ())
    }

    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        call(
            &self.http,
            self.command_timeout,
            Method::POST,
            format!("{}/url", self.root),
            Some(json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, AutomationError> {
        let (using, value) = locator.strategy();
        let found = call(
            &self.http,
            self.command_timeout,
            Method::POST,
            format!("{}/elements", self.root),
            Some(json!({ "using": using, "value": value })),
        )
        .await?;
        Ok(element_refs(&found))
    }

    async fn find_within(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> Result<Vec<ElementRef>, AutomationError> {
        let (using, value) = locator.strategy();
        let found = call(
            &self.http,
            self.command_timeout,
            Method::POST,
            self.element_url(parent, "elements"),
            Some(json!({ "using": using, "value": value })),
        )
        .await?;
        Ok(element_refs(&found))
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, AutomationError> {
        let value = call(
            &self.http,
            self.command_timeout,
            Method::GET,
            self.element_url(element, &format!("attribute/{name}")),
            None,
        )
        .await?;
        Ok(value.as_str().map(str::to_string).filter(|v| !v.is_empty()))
    }

    async fn click(&self, element: &ElementRef) -> Result<(), AutomationError> {
        call(
            &self.http,
            self.command_timeout,
            Method::POST,
            self.element_url(element, "click"),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        call(&self.http, self.command_timeout, Method::DELETE, self.root.clone(), None)
            .await
            .map(|_| ())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(target = "listing_bot.automation", session = %self.root, "session_dropped_unclosed");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let http = self.http.clone();
            let root = self.root.clone();
            let limit = self.command_timeout;
            handle.spawn(async move {
                let _ = call(&http, limit, Method::DELETE, root, None).await;
            });
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    value: Value,
}

async fn call(
    http: &Client,
    limit: Duration,
    method: Method,
    url: String,
    body: Option<Value>,
) -> Result<Value, AutomationError> {
    let mut request = http.request(method, url).timeout(limit);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let envelope: Envelope = response
        .json()
        .await
        .map_err(|err| AutomationError::Protocol(format!("HTTP {status}: {err}")))?;
    if !status.is_success() {
        let error = envelope
            .value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let message = envelope
            .value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        return Err(AutomationError::WebDriver { error, message });
    }
    Ok(envelope.value)
}

fn element_refs(value: &Value) -> Vec<ElementRef> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(|id| ElementRef(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_refs_read_w3c_keys() {
        let value = json!([
            { ELEMENT_KEY: "a" },
            { "unrelated": "b" },
            { ELEMENT_KEY: "c" },
        ]);
        assert_eq!(
            element_refs(&value),
            vec![ElementRef("a".into()), ElementRef("c".into())]
        );
        assert!(element_refs(&json!(null)).is_empty());
    }

    #[test]
    fn commands_outlast_the_page_load_deadline() {
        let page_load = Duration::from_secs(15);
        let client = WebDriverClient::new("http://localhost:4444/wd/hub/", Client::new(), page_load);
        assert!(client.command_timeout > page_load);
        assert_eq!(client.command_timeout, Duration::from_secs(45));
        assert_eq!(client.base_url, "http://localhost:4444/wd/hub");
    }

    #[test]
    fn locator_strategies() {
        assert_eq!(Locator::css("img").strategy(), ("css selector", "img"));
        assert_eq!(Locator::xpath("//div").strategy(), ("xpath", "//div"));
    }
}
