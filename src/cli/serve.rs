//! `labelscan serve` — run the REST API.

use crate::app::App;
use crate::config::Settings;
use crate::rest;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub async fn run(port: u16) -> Result<()> {
    let settings = Settings::from_env();
    let app = App::new(settings);

    tokio::select! {
        result = rest::serve(port, Arc::clone(&app)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            app.shutdown().await;
            Ok(())
        }
    }
}
