//! Rendering session manager.
//!
//! Owns the single expensive browser resource: lazy single-flight startup,
//! a global render gate enforcing minimum spacing plus randomized jitter,
//! per-request page contexts that are always released, and idle-based
//! teardown. The raw browser handle never leaves this module; everything
//! goes through the [`Renderer`]/[`RenderContext`] traits.

pub mod chromium;

use crate::config::SessionConfig;
use crate::events::{EventBus, ScanEvent};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A browser engine that can open rendering contexts.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open a new isolated context (tab).
    async fn new_context(&self) -> Result<Box<dyn RenderContext>>;
    /// Shut the engine down.
    async fn shutdown(&self) -> Result<()>;
    /// Whether the engine is still reachable.
    fn is_connected(&self) -> bool;
    /// Number of currently open contexts.
    fn active_contexts(&self) -> usize;
}

/// One isolated context, used for exactly one render cycle.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Navigate to `url` and return the rendered document markup.
    async fn render(&mut self, url: &str, timeout: Duration) -> Result<String>;
    /// Release this context.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Launches renderer instances; the seam that lets tests stub the browser.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Renderer>>;
}

/// Why a render failed at the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The browser could not be started at all. Not retryable; makes the
    /// whole pipeline unusable.
    #[error("browser startup failed: {0}")]
    Startup(String),
    /// The browser went away mid-operation. Retryable; the next render
    /// transparently re-initializes.
    #[error("rendering session unavailable: {0}")]
    Unavailable(String),
    /// Navigation or extraction failed while the browser stayed up.
    #[error("render failed: {0}")]
    Render(String),
}

/// Point-in-time health snapshot for the REST layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub status: &'static str,
    pub session: &'static str,
    pub active_contexts: usize,
    pub total_renders: u64,
}

struct Slot {
    renderer: Option<Arc<dyn Renderer>>,
    ever_started: bool,
}

struct Gate {
    last_finished: Option<Instant>,
}

/// Owns the one shared rendering resource and mediates all access to it.
pub struct SessionManager {
    factory: Arc<dyn RendererFactory>,
    cfg: SessionConfig,
    events: Arc<EventBus>,
    /// Lazily-started browser. The lock is held across startup so that
    /// concurrent callers observe a single initialization.
    slot: Arc<Mutex<Slot>>,
    /// Global render gate: at most one in-flight render, with spacing
    /// enforced from the end of the previous one.
    gate: Arc<Mutex<Gate>>,
    /// Pending idle-teardown timer. At most one exists at a time.
    idle_timer: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    total_renders: Arc<AtomicU64>,
    startup_failed: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn RendererFactory>,
        cfg: SessionConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            factory,
            cfg,
            events,
            slot: Arc::new(Mutex::new(Slot {
                renderer: None,
                ever_started: false,
            })),
            gate: Arc::new(Mutex::new(Gate {
                last_finished: None,
            })),
            idle_timer: Arc::new(std::sync::Mutex::new(None)),
            total_renders: Arc::new(AtomicU64::new(0)),
            startup_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotently make sure the browser is up, starting it if needed.
    /// Concurrent callers all wait on the same initialization.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn Renderer>, SessionError> {
        let mut slot = self.slot.lock().await;

        if let Some(renderer) = &slot.renderer {
            if renderer.is_connected() {
                return Ok(Arc::clone(renderer));
            }
            // Disconnected underneath us; discard and start fresh.
            warn!("rendering session disconnected; restarting");
            if let Some(old) = slot.renderer.take() {
                let _ = old.shutdown().await;
            }
        }

        info!("starting rendering session");
        match self.factory.launch().await {
            Ok(renderer) => {
                slot.renderer = Some(Arc::clone(&renderer));
                slot.ever_started = true;
                self.startup_failed.store(false, Ordering::SeqCst);
                self.events.emit(ScanEvent::SessionStarted);
                self.arm_idle_timer();
                Ok(renderer)
            }
            Err(e) => {
                self.startup_failed.store(true, Ordering::SeqCst);
                Err(SessionError::Startup(format!("{e:#}")))
            }
        }
    }

    /// Render one page: acquire an isolated context, navigate, extract the
    /// markup, and always release the context. Renders are serialized and
    /// paced behind the global gate.
    pub async fn render(&self, url: &str, timeout: Duration) -> Result<String, SessionError> {
        let renderer = self.ensure_ready().await?;

        let mut gate = self.gate.lock().await;
        if let Some(last) = gate.last_finished {
            let jitter = self.pick_jitter();
            let due = last + self.cfg.min_spacing + jitter;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                debug!("pacing render of {url}: waiting {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }

        let result = render_once(&renderer, url, timeout).await;
        gate.last_finished = Some(Instant::now());
        drop(gate);

        match result {
            Ok(html) => {
                self.total_renders.fetch_add(1, Ordering::Relaxed);
                self.arm_idle_timer();
                Ok(html)
            }
            Err(e) => {
                if !renderer.is_connected() {
                    // The browser died mid-operation. Tear the slot down so
                    // the next call re-initializes; retrying is the fetch
                    // client's job.
                    close_slot(&self.slot, &self.events, "browser disconnected").await;
                    Err(SessionError::Unavailable(format!("{e:#}")))
                } else {
                    self.arm_idle_timer();
                    Err(SessionError::Render(format!("{e:#}")))
                }
            }
        }
    }

    /// Explicitly close the session (shutdown path).
    pub async fn close(&self) {
        if let Some(handle) = self.idle_timer.lock().unwrap().take() {
            handle.abort();
        }
        close_slot(&self.slot, &self.events, "explicit close").await;
    }

    /// Health snapshot for `/health`.
    pub async fn health(&self) -> SessionHealth {
        let slot = self.slot.lock().await;
        let (session, active) = match &slot.renderer {
            Some(r) if r.is_connected() => ("ready", r.active_contexts()),
            Some(_) => ("closed", 0),
            None if slot.ever_started => ("closed", 0),
            None => ("uninitialized", 0),
        };
        let status = if self.startup_failed.load(Ordering::SeqCst) {
            "unhealthy"
        } else if session == "ready" {
            "healthy"
        } else {
            "degraded"
        };
        SessionHealth {
            status,
            session,
            active_contexts: active,
            total_renders: self.total_renders.load(Ordering::Relaxed),
        }
    }

    pub fn total_renders(&self) -> u64 {
        self.total_renders.load(Ordering::Relaxed)
    }

    fn pick_jitter(&self) -> Duration {
        let lo = self.cfg.jitter_min.as_millis() as u64;
        let hi = self.cfg.jitter_max.as_millis() as u64;
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// (Re)arm the idle-teardown timer, cancelling any pending one so at
    /// most a single timer exists per session instance.
    fn arm_idle_timer(&self) {
        let idle = self.cfg.idle_timeout;
        let slot = Arc::clone(&self.slot);
        let events = Arc::clone(&self.events);
        let timer_slot = Arc::clone(&self.idle_timer);

        let mut guard = self.idle_timer.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            // Drop our own handle first so the teardown below cannot be
            // aborted by a concurrent re-arm racing on the same handle.
            timer_slot.lock().unwrap().take();
            close_slot(&slot, &events, "idle timeout").await;
        }));
    }
}

async fn render_once(
    renderer: &Arc<dyn Renderer>,
    url: &str,
    timeout: Duration,
) -> Result<String> {
    let mut ctx = renderer.new_context().await?;
    let result = ctx.render(url, timeout).await;
    if let Err(e) = ctx.close().await {
        warn!("page context close failed: {e:#}");
    }
    result
}

async fn close_slot(slot: &Mutex<Slot>, events: &EventBus, reason: &str) {
    let renderer = slot.lock().await.renderer.take();
    if let Some(renderer) = renderer {
        info!("closing rendering session: {reason}");
        if let Err(e) = renderer.shutdown().await {
            warn!("session shutdown error: {e:#}");
        }
        events.emit(ScanEvent::SessionClosed {
            reason: reason.to_string(),
        });
    }
}
