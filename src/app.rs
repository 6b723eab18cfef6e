//! Application wiring shared by the CLI commands and the REST server.

use crate::config::Settings;
use crate::events::EventBus;
use crate::fetch::{FetchClient, Fetcher, PageSource};
use crate::job::orchestrator::Orchestrator;
use crate::session::chromium::ChromiumFactory;
use crate::session::{RendererFactory, SessionManager};
use std::sync::Arc;
use std::time::Instant;

/// The assembled pipeline: session manager, fetch client, orchestrator,
/// and the event bus they all share.
pub struct App {
    pub settings: Settings,
    pub events: Arc<EventBus>,
    pub session: Arc<SessionManager>,
    pub fetcher: Arc<FetchClient>,
    pub orchestrator: Orchestrator,
    pub started_at: Instant,
}

impl App {
    /// Build the pipeline against a real headless Chromium.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_factory(settings, Arc::new(ChromiumFactory))
    }

    /// Build the pipeline against an arbitrary renderer factory.
    pub fn with_factory(settings: Settings, factory: Arc<dyn RendererFactory>) -> Arc<Self> {
        let events = Arc::new(EventBus::default());
        let session = Arc::new(SessionManager::new(
            factory,
            settings.session.clone(),
            Arc::clone(&events),
        ));
        let fetcher = Arc::new(FetchClient::new(
            Arc::clone(&session) as Arc<dyn PageSource>,
            settings.fetch.clone(),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            settings.orchestrator.clone(),
            Arc::clone(&events),
        );
        Arc::new(Self {
            settings,
            events,
            session,
            fetcher,
            orchestrator,
            started_at: Instant::now(),
        })
    }

    /// Graceful shutdown: stop any active run and release the browser.
    pub async fn shutdown(&self) {
        self.orchestrator.stop().await;
        self.session.close().await;
    }
}
