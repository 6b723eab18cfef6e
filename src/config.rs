//! Runtime configuration.
//!
//! All knobs are plain numeric/duration settings with documented defaults,
//! overridable through `LABELSCAN_*` environment variables. Components
//! receive the sub-struct they care about, never the whole bag.

use std::time::Duration;

/// Default REST API port.
pub const DEFAULT_HTTP_PORT: u16 = 7343;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of parallel workers pulling from the queue.
    pub max_concurrency: usize,
    /// Fixed delay between items on one worker.
    pub pacing: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            pacing: Duration::from_millis(500),
        }
    }
}

/// Fetch client settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Retries after the first attempt (2 retries = 3 attempts total).
    pub retries: u32,
    /// Linear backoff base: wait `attempt * backoff_base` before a retry.
    pub backoff_base: Duration,
    /// Per-attempt ceiling after which the attempt counts as a transient
    /// failure.
    pub attempt_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_base: Duration::from_millis(2000),
            attempt_timeout: Duration::from_secs(45),
        }
    }
}

/// Rendering session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum spacing between renders, measured from the end of the
    /// previous render.
    pub min_spacing: Duration,
    /// Randomized jitter layered on top of `min_spacing`.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Inactivity window after which the browser is torn down.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(2000),
            jitter_min: Duration::from_millis(500),
            jitter_max: Duration::from_millis(1500),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// The full settings bag, as read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub fetch: FetchConfig,
    pub session: SessionConfig,
}

impl Settings {
    /// Read settings from `LABELSCAN_*` env vars, falling back to the
    /// documented defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            orchestrator: OrchestratorConfig {
                max_concurrency: read_env_usize(
                    "LABELSCAN_MAX_CONCURRENCY",
                    d.orchestrator.max_concurrency,
                )
                .max(1),
                pacing: Duration::from_millis(read_env_u64(
                    "LABELSCAN_PACING_MS",
                    d.orchestrator.pacing.as_millis() as u64,
                )),
            },
            fetch: FetchConfig {
                retries: read_env_u32("LABELSCAN_RETRIES", d.fetch.retries),
                backoff_base: Duration::from_millis(read_env_u64(
                    "LABELSCAN_BACKOFF_BASE_MS",
                    d.fetch.backoff_base.as_millis() as u64,
                )),
                attempt_timeout: Duration::from_millis(read_env_u64(
                    "LABELSCAN_ATTEMPT_TIMEOUT_MS",
                    d.fetch.attempt_timeout.as_millis() as u64,
                )),
            },
            session: SessionConfig {
                min_spacing: Duration::from_millis(read_env_u64(
                    "LABELSCAN_MIN_SPACING_MS",
                    d.session.min_spacing.as_millis() as u64,
                )),
                jitter_min: Duration::from_millis(read_env_u64(
                    "LABELSCAN_JITTER_MIN_MS",
                    d.session.jitter_min.as_millis() as u64,
                )),
                jitter_max: Duration::from_millis(read_env_u64(
                    "LABELSCAN_JITTER_MAX_MS",
                    d.session.jitter_max.as_millis() as u64,
                )),
                idle_timeout: Duration::from_secs(read_env_u64(
                    "LABELSCAN_IDLE_TIMEOUT_SECS",
                    d.session.idle_timeout.as_secs(),
                )),
            },
        }
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
}
