//! `labelscan doctor` — environment and configuration check.

use crate::config::Settings;
use crate::session::chromium;
use anyhow::Result;

pub async fn run() -> Result<()> {
    match chromium::find_chromium() {
        Some(path) => println!("chromium:          {}", path.display()),
        None => println!(
            "chromium:          NOT FOUND (set LABELSCAN_CHROMIUM_PATH or install google-chrome)"
        ),
    }

    let s = Settings::from_env();
    println!("max concurrency:   {}", s.orchestrator.max_concurrency);
    println!("pacing:            {}ms", s.orchestrator.pacing.as_millis());
    println!("retries:           {}", s.fetch.retries);
    println!("backoff base:      {}ms", s.fetch.backoff_base.as_millis());
    println!("attempt timeout:   {}ms", s.fetch.attempt_timeout.as_millis());
    println!("min spacing:       {}ms", s.session.min_spacing.as_millis());
    println!(
        "jitter:            {}-{}ms",
        s.session.jitter_min.as_millis(),
        s.session.jitter_max.as_millis()
    );
    println!("idle timeout:      {}s", s.session.idle_timeout.as_secs());
    Ok(())
}
