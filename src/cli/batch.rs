//! `labelscan batch <file>` — scan a newline-delimited list of URLs.
//!
//! One URL per line; blank lines and `#` comments are skipped. The line
//! number doubles as the row correlation id.

use crate::app::App;
use crate::config::Settings;
use crate::events::ScanEvent;
use crate::target::Target;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;

/// Read one target per line; the line number is the row correlation id.
fn read_targets(path: &Path) -> Result<Vec<Target>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let targets: Vec<Target> = content
        .lines()
        .enumerate()
        .map(|(i, line)| (i as u64 + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(row, line)| Target::new(row, line.to_string()))
        .collect();
    if targets.is_empty() {
        bail!("no targets found in {}", path.display());
    }
    Ok(targets)
}

pub async fn run(path: &Path, json: bool) -> Result<()> {
    let targets = read_targets(path)?;

    let app = App::new(Settings::from_env());

    // Print per-row outcomes as they settle.
    let mut rx = app.events.subscribe();
    let quiet = json;
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ScanEvent::JobFinished {
                    row,
                    url,
                    classification,
                    error,
                    ..
                }) => {
                    if quiet {
                        continue;
                    }
                    match (classification, error) {
                        (Some(marks), _) => println!(
                            "row {row}: fiche={} label={} mouseover={}  {url}",
                            marks.product_fiche, marks.energy_label, marks.mouseover_label
                        ),
                        (None, Some(message)) => println!("row {row}: ERROR {message}  {url}"),
                        (None, None) => {}
                    }
                }
                Ok(ScanEvent::RunCompleted { .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let summary = app.orchestrator.run(targets).await?;
    let _ = printer.await;
    app.session.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} succeeded, {} failed out of {} in {}ms{}",
            summary.succeeded,
            summary.failed,
            summary.total,
            summary.elapsed_ms,
            if summary.stopped { " (stopped)" } else { "" }
        );
    }
    Ok(())
}
