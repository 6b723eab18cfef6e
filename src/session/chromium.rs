//! Chromium browser engine via chromiumoxide.
//!
//! Implements the [`Renderer`]/[`RenderContext`] seam for the session
//! manager. Each render context is one tab, used for a single
//! render-and-extract cycle and then closed.

use super::{RenderContext, Renderer, RendererFactory};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Find the Chromium binary.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. LABELSCAN_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("LABELSCAN_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.labelscan/chromium/
    if let Some(home) = dirs::home_dir() {
        for c in [
            home.join(".labelscan/chromium/chrome-linux64/chrome"),
            home.join(".labelscan/chromium/chrome"),
        ] {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    None
}

/// Launches headless Chromium instances on demand.
pub struct ChromiumFactory;

#[async_trait]
impl RendererFactory for ChromiumFactory {
    async fn launch(&self) -> Result<Arc<dyn Renderer>> {
        let renderer = ChromiumRenderer::launch().await?;
        Ok(Arc::new(renderer))
    }
}

/// A running headless Chromium instance.
pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    handler_task: tokio::task::JoinHandle<()>,
    connected: Arc<AtomicBool>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found. Set LABELSCAN_CHROMIUM_PATH or install google-chrome")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--lang=de-DE")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        // Drain CDP events until the browser goes away; the flag is how
        // the session manager notices a disconnect.
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
            flag.store(false, Ordering::SeqCst);
            debug!("browser event stream ended");
        });

        Ok(Self {
            browser: Mutex::new(browser),
            handler_task,
            connected,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumContext {
            page,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.browser.lock().await.close().await;
        self.handler_task.abort();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// One Chromium tab, good for exactly one render cycle.
pub struct ChromiumContext {
    page: Page,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn render(&mut self, url: &str, timeout: Duration) -> Result<String> {
        let nav = tokio::time::timeout(timeout, self.page.goto(url)).await;
        match nav {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
            }
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {}ms", timeout.as_millis()),
        }

        let result = self
            .page
            .evaluate("document.documentElement.outerHTML")
            .await
            .context("failed to read rendered markup")?;

        let html: String = result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert markup result: {e:?}"))?;

        Ok(html)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.page.close().await;
        Ok(())
    }
}
