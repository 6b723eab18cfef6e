//! `labelscan analyze <url>` — one-shot classification of a single page.

use crate::app::App;
use crate::config::Settings;
use crate::target::{self, Target};
use anyhow::{bail, Result};
use serde_json::json;

pub async fn run(url: &str, json: bool) -> Result<()> {
    if let Err(e) = target::validate_url(url) {
        bail!("{} ({})", e, e.code());
    }

    let app = App::new(Settings::from_env());
    let result = app.fetcher.fetch(&Target::new(0, url.to_string())).await;
    app.session.close().await;

    match result {
        Ok(report) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "url": url,
                        "productFiche": report.classification.product_fiche,
                        "energyLabel": report.classification.energy_label,
                        "mouseoverLabel": report.classification.mouseover_label,
                        "timestampISO8601": report.analyzed_at.to_rfc3339(),
                        "processingTimeMs": report.processing_ms,
                        "diagnostics": report.diagnostics,
                    }))?
                );
            } else {
                println!("{url}");
                println!("  product fiche:   {}", report.classification.product_fiche);
                println!("  energy label:    {}", report.classification.energy_label);
                println!("  mouseover label: {}", report.classification.mouseover_label);
                println!("  analyzed in {}ms", report.processing_ms);
            }
            Ok(())
        }
        Err(e) => bail!("analysis failed ({}): {}", e.code(), e),
    }
}
