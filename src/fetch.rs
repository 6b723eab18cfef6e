//! Fetch client — one logical render-and-classify operation per target.
//!
//! Hides retry, timeout, and error-classification mechanics from the
//! orchestrator. Concurrent requests for the same target are coalesced
//! onto a single underlying operation; every caller observes the same
//! settled result. All failures come back as values, never panics.

use crate::classify::{self, PageKind};
use crate::config::FetchConfig;
use crate::session::{SessionError, SessionManager};
use crate::target::{Target, TargetError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Successful analysis of one target.
#[derive(Debug, Clone)]
pub struct PageReport {
    pub classification: classify::Classification,
    pub diagnostics: classify::Diagnostics,
    pub analyzed_at: DateTime<Utc>,
    pub processing_ms: u64,
}

/// Why a fetch failed. Cloneable so deduplicated callers can share it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] TargetError),
    #[error("rate limited: marketplace served its robot check")]
    RateLimited,
    #[error("target is not a product page")]
    NotSupported,
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rendering session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("browser startup failed: {0}")]
    Startup(String),
    #[error("classification failed: {0}")]
    Classify(String),
}

impl FetchError {
    /// Whether the retry budget applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transient(_) | Self::SessionUnavailable(_)
        )
    }

    /// Stable wire code for the REST layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::RateLimited => "RATE_LIMITED",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Timeout(_) | Self::Transient(_) | Self::Classify(_) => "ANALYSIS_FAILED",
            Self::SessionUnavailable(_) | Self::Startup(_) => "SESSION_UNAVAILABLE",
        }
    }
}

pub type FetchResult = Result<PageReport, FetchError>;

/// Where rendered markup comes from; the seam that lets tests bypass the
/// real session manager.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration) -> Result<String, SessionError>;
}

#[async_trait]
impl PageSource for SessionManager {
    async fn render(&self, url: &str, timeout: Duration) -> Result<String, SessionError> {
        SessionManager::render(self, url, timeout).await
    }
}

/// The orchestrator's view of the fetch layer.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &Target) -> FetchResult;
    /// Stop spending retry budget on outstanding operations.
    fn abandon_retries(&self);
    /// Re-enable retries for a new run.
    fn reset(&self);
}

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Produces a classification result for one target.
pub struct FetchClient {
    source: Arc<dyn PageSource>,
    cfg: FetchConfig,
    /// Pending operations keyed by URL; an entry is removed when the
    /// underlying operation settles, however many callers awaited it.
    in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
    abandon: Arc<AtomicBool>,
    total_requests: Arc<AtomicU64>,
}

impl FetchClient {
    pub fn new(source: Arc<dyn PageSource>, cfg: FetchConfig) -> Self {
        Self {
            source,
            cfg,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            abandon: Arc::new(AtomicBool::new(false)),
            total_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Analyze one target. Invalid targets fail immediately and never
    /// reach the session; duplicate concurrent calls share one operation.
    pub async fn fetch(&self, target: &Target) -> FetchResult {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        target.validate()?;

        let key = target.url.clone();
        let fut = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(pending) = in_flight.get(&key) {
                debug!("coalescing duplicate fetch of {key}");
                pending.clone()
            } else {
                let source = Arc::clone(&self.source);
                let cfg = self.cfg.clone();
                let abandon = Arc::clone(&self.abandon);
                let registry = Arc::clone(&self.in_flight);
                let url = target.url.clone();
                let entry_key = key.clone();
                let fut = async move {
                    let result = fetch_with_retry(&*source, &cfg, &abandon, &url).await;
                    registry.lock().await.remove(&entry_key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key, fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Number of distinct operations currently in flight.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Fetcher for FetchClient {
    async fn fetch(&self, target: &Target) -> FetchResult {
        FetchClient::fetch(self, target).await
    }

    fn abandon_retries(&self) {
        self.abandon.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.abandon.store(false, Ordering::SeqCst);
    }
}

/// Run up to `retries + 1` attempts with linear backoff between them.
async fn fetch_with_retry(
    source: &dyn PageSource,
    cfg: &FetchConfig,
    abandon: &AtomicBool,
    url: &str,
) -> FetchResult {
    let attempts = cfg.retries + 1;
    let mut last_err = FetchError::Transient("no attempts made".to_string());

    for attempt in 1..=attempts {
        if attempt > 1 {
            if abandon.load(Ordering::SeqCst) {
                debug!("abandoning retries for {url}");
                break;
            }
            let delay = cfg.backoff_base * (attempt - 1);
            debug!("retrying {url} in {}ms (attempt {attempt}/{attempts})", delay.as_millis());
            tokio::time::sleep(delay).await;
            if abandon.load(Ordering::SeqCst) {
                break;
            }
        }

        match attempt_once(source, cfg, url).await {
            Ok(report) => return Ok(report),
            Err(e) if e.is_retryable() => {
                warn!("attempt {attempt}/{attempts} for {url} failed: {e}");
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err)
}

/// One attempt: render under the per-attempt ceiling, then classify.
async fn attempt_once(source: &dyn PageSource, cfg: &FetchConfig, url: &str) -> FetchResult {
    let started = Instant::now();

    let rendered = tokio::time::timeout(cfg.attempt_timeout, source.render(url, cfg.attempt_timeout)).await;
    let html = match rendered {
        Err(_) => return Err(FetchError::Timeout(cfg.attempt_timeout)),
        Ok(Err(SessionError::Startup(msg))) => return Err(FetchError::Startup(msg)),
        Ok(Err(SessionError::Unavailable(msg))) => {
            return Err(FetchError::SessionUnavailable(msg))
        }
        Ok(Err(SessionError::Render(msg))) => return Err(FetchError::Transient(msg)),
        Ok(Ok(html)) => html,
    };

    match classify::page_kind(&html) {
        PageKind::RobotCheck => return Err(FetchError::RateLimited),
        PageKind::NotProduct => return Err(FetchError::NotSupported),
        PageKind::Product => {}
    }

    match classify::classify(&html) {
        Ok(page) => Ok(PageReport {
            classification: page.marks,
            diagnostics: page.diagnostics,
            analyzed_at: Utc::now(),
            processing_ms: started.elapsed().as_millis() as u64,
        }),
        Err(e) => Err(FetchError::Classify(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Mark;
    use std::sync::atomic::AtomicUsize;

    const PRODUCT_PAGE: &str = r##"
        <html><body><div id="dp-container">
          <div class="energy-efficiency-label">
            <span class="energy-badge" data-action="a-popover"
                  data-a-popover='{"url":"/label"}'>A</span>
            <img src="/energy.png" alt="Energy class A">
          </div>
          <div class="product-fiche"><a href="/fiche.pdf">Product fiche</a></div>
        </div></body></html>"##;

    const ROBOT_PAGE: &str =
        r#"<html><head><title>Robot Check</title></head><body></body></html>"#;

    /// Scripted page source: pops one response per render call.
    struct ScriptedSource {
        responses: std::sync::Mutex<Vec<Result<String, SessionError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<String, SessionError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn always_ok(html: &str) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(vec![Ok(html.to_string()); 16]),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn render(&self, _url: &str, _timeout: Duration) -> Result<String, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SessionError::Render("script exhausted".to_string()));
            }
            responses.remove(0)
        }
    }

    fn quick_cfg() -> FetchConfig {
        FetchConfig {
            retries: 2,
            backoff_base: Duration::from_millis(10),
            attempt_timeout: Duration::from_millis(500),
        }
    }

    fn target(url: &str) -> Target {
        Target::new(1, url)
    }

    #[tokio::test]
    async fn test_successful_classification() {
        let source = ScriptedSource::always_ok(PRODUCT_PAGE);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let report = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap();
        assert_eq!(report.classification.product_fiche, Mark::Yes);
        assert_eq!(report.classification.energy_label, Mark::Yes);
        assert_eq!(report.classification.mouseover_label, Mark::Yes);
        assert_eq!(source.calls(), 1);
        assert_eq!(client.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_target_never_reaches_session() {
        let source = ScriptedSource::always_ok(PRODUCT_PAGE);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://example.com/dp/B0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
        assert_eq!(err.code(), "NOT_SUPPORTED_DOMAIN");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_uses_full_budget() {
        let source = ScriptedSource::new(vec![
            Err(SessionError::Render("boom".to_string())),
            Err(SessionError::Render("boom".to_string())),
            Err(SessionError::Render("boom".to_string())),
        ]);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
        // retries = 2 → exactly 3 attempts.
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried() {
        let source = ScriptedSource::new(vec![Ok(ROBOT_PAGE.to_string())]);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::RateLimited);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_product_page_is_not_retried() {
        let source =
            ScriptedSource::new(vec![Ok("<html><body>search</body></html>".to_string())]);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotSupported);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let source = Arc::new(ScriptedSource {
            responses: std::sync::Mutex::new(vec![Ok(PRODUCT_PAGE.to_string()); 4]),
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
        });
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_are_deduplicated() {
        let source = Arc::new(ScriptedSource {
            responses: std::sync::Mutex::new(vec![Ok(PRODUCT_PAGE.to_string()); 4]),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let client = Arc::new(FetchClient::new(
            source.clone() as Arc<dyn PageSource>,
            quick_cfg(),
        ));

        let t = target("https://www.amazon.de/dp/B0");
        let a = {
            let c = Arc::clone(&client);
            let t = t.clone();
            tokio::spawn(async move { c.fetch(&t).await })
        };
        let b = {
            let c = Arc::clone(&client);
            let t = t.clone();
            tokio::spawn(async move { c.fetch(&t).await })
        };

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert_eq!(ra.classification, rb.classification);
        // The session saw the overlapping callers as one operation.
        assert_eq!(source.calls(), 1);
        assert_eq!(client.in_flight_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_targets_are_not_deduplicated() {
        let source = Arc::new(ScriptedSource {
            responses: std::sync::Mutex::new(vec![Ok(PRODUCT_PAGE.to_string()); 4]),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let client = Arc::new(FetchClient::new(
            source.clone() as Arc<dyn PageSource>,
            quick_cfg(),
        ));

        let a = {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.fetch(&target("https://www.amazon.de/dp/AA")).await })
        };
        let b = {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.fetch(&target("https://www.amazon.de/dp/BB")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_skips_remaining_retries() {
        let source = ScriptedSource::new(vec![
            Err(SessionError::Render("boom".to_string())),
            Err(SessionError::Render("boom".to_string())),
            Err(SessionError::Render("boom".to_string())),
        ]);
        let client = FetchClient::new(source.clone(), quick_cfg());
        Fetcher::abandon_retries(&client);

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
        assert_eq!(source.calls(), 1);

        Fetcher::reset(&client);
    }

    #[tokio::test]
    async fn test_startup_failure_is_not_retried() {
        let source = ScriptedSource::new(vec![Err(SessionError::Startup(
            "no browser".to_string(),
        ))]);
        let client = FetchClient::new(source.clone(), quick_cfg());

        let err = client
            .fetch(&target("https://www.amazon.de/dp/B0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Startup(_)));
        assert_eq!(err.code(), "SESSION_UNAVAILABLE");
        assert_eq!(source.calls(), 1);
    }
}
