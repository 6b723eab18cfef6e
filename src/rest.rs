// Copyright 2026 Labelscan Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP REST API.
//!
//! One route per pipeline operation: single-target analysis, batch run
//! control, health, counters, and a server-sent-events feed of the scan
//! event bus for the UI layer.

use crate::app::App;
use crate::classify::Classification;
use crate::fetch::FetchError;
use crate::target::{self, Target};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Build the axum router with all endpoints.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/analyze", post(handle_analyze))
        .route("/run", post(handle_run))
        .route("/run/pause", post(handle_pause))
        .route("/run/resume", post(handle_resume))
        .route("/run/stop", post(handle_stop))
        .route("/run/jobs", get(handle_jobs))
        .route("/events", get(handle_events_sse))
        .layer(cors)
        .with_state(app)
}

/// Bind and serve on localhost.
pub async fn serve(port: u16, app: Arc<App>) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on http://{}", listener.local_addr()?);
    serve_on(listener, app).await
}

/// Serve on an already-bound listener (lets tests use an ephemeral port).
pub async fn serve_on(listener: tokio::net::TcpListener, app: Arc<App>) -> anyhow::Result<()> {
    axum::serve(listener, router(app)).await?;
    Ok(())
}

fn error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({ "error": { "code": code, "message": message } }))
}

fn fetch_error_status(e: &FetchError) -> StatusCode {
    match e {
        FetchError::Validation(_) => StatusCode::BAD_REQUEST,
        FetchError::SessionUnavailable(_) | FetchError::Startup(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

// ── Handlers ────────────────────────────────────────────────────

async fn handle_health(State(app): State<Arc<App>>) -> Json<Value> {
    let health = app.session.health().await;
    Json(json!({
        "status": health.status,
        "session": health.session,
        "activeContexts": health.active_contexts,
        "totalRenders": health.total_renders,
        "uptimeSeconds": app.started_at.elapsed().as_secs_f64(),
    }))
}

async fn stats_json(app: &App) -> Json<Value> {
    let stats = app.orchestrator.stats().await;
    Json(json!({
        "running": stats.running,
        "paused": stats.paused,
        "queueDepth": stats.queue_depth,
        "active": stats.active,
        "total": stats.total,
        "processed": stats.processed,
        "succeeded": stats.succeeded,
        "failed": stats.failed,
        "inFlight": app.fetcher.in_flight_count().await,
        "totalRequests": app.fetcher.total_requests(),
    }))
}

async fn handle_stats(State(app): State<Arc<App>>) -> Json<Value> {
    stats_json(&app).await
}

#[derive(Deserialize, Default)]
struct AnalyzeBody {
    target: Option<String>,
}

async fn handle_analyze(
    State(app): State<Arc<App>>,
    Json(body): Json<AnalyzeBody>,
) -> impl IntoResponse {
    let raw = body.target.unwrap_or_default();
    if let Err(e) = target::validate_url(&raw) {
        return (StatusCode::BAD_REQUEST, error_body(e.code(), &e.to_string()))
            .into_response();
    }

    match app.fetcher.fetch(&Target::new(0, raw)).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "productFiche": report.classification.product_fiche,
                "energyLabel": report.classification.energy_label,
                "mouseoverLabel": report.classification.mouseover_label,
                "timestampISO8601": report.analyzed_at.to_rfc3339(),
                "processingTimeMs": report.processing_ms,
            })),
        )
            .into_response(),
        Err(e) => {
            let status = fetch_error_status(&e);
            if status == StatusCode::UNPROCESSABLE_ENTITY {
                // Terminal analysis failure: every predicate reads Error,
                // with the failure attached.
                let marks = Classification::all_error();
                (
                    status,
                    Json(json!({
                        "productFiche": marks.product_fiche,
                        "energyLabel": marks.energy_label,
                        "mouseoverLabel": marks.mouseover_label,
                        "error": { "code": e.code(), "message": e.to_string() },
                    })),
                )
                    .into_response()
            } else {
                (status, error_body(e.code(), &e.to_string())).into_response()
            }
        }
    }
}

#[derive(Deserialize)]
struct RunTarget {
    row: u64,
    url: String,
}

#[derive(Deserialize)]
struct RunBody {
    targets: Vec<RunTarget>,
}

async fn handle_run(
    State(app): State<Arc<App>>,
    Json(body): Json<RunBody>,
) -> impl IntoResponse {
    if app.orchestrator.is_running() {
        return (
            StatusCode::CONFLICT,
            error_body("ALREADY_RUNNING", "a scan run is already in progress"),
        )
            .into_response();
    }

    let batch: Vec<Target> = body
        .targets
        .into_iter()
        .map(|t| Target::new(t.row, t.url))
        .collect();
    let mut seen = HashSet::new();
    let unique = batch.iter().filter(|t| seen.insert(t.url.clone())).count();
    let skipped = batch.len() - unique;

    let orchestrator = app.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run(batch).await {
            warn!("run ended with error: {e}");
        }
    });

    // Give the spawned run a moment to claim the active slot so a caller
    // issuing a second POST right away sees ALREADY_RUNNING, not a race.
    for _ in 0..50 {
        if app.orchestrator.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "total": unique, "skipped": skipped })),
    )
        .into_response()
}

async fn handle_pause(State(app): State<Arc<App>>) -> Json<Value> {
    app.orchestrator.pause();
    stats_json(&app).await
}

async fn handle_resume(State(app): State<Arc<App>>) -> Json<Value> {
    app.orchestrator.resume();
    stats_json(&app).await
}

async fn handle_stop(State(app): State<Arc<App>>) -> Json<Value> {
    app.orchestrator.stop().await;
    stats_json(&app).await
}

async fn handle_jobs(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!({ "jobs": app.orchestrator.jobs().await }))
}

/// Server-Sent Events endpoint streaming the scan event bus.
async fn handle_events_sse(
    State(app): State<Arc<App>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = app.events.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Slow consumer missed events; keep streaming.
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
