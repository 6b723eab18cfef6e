//! Job data model for a scan run.

pub mod orchestrator;

use crate::classify::Classification;
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// Mutable processing record for one target within one run.
///
/// Owned exclusively by the orchestrator worker that claimed it; the fetch
/// client and classifier only ever see the target and return results by
/// value. `classification` is fully populated exactly when the status is
/// `Completed`; `error` is set exactly when the status is `Error`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub target: Target,
    pub status: JobStatus,
    pub classification: Option<Classification>,
    pub error: Option<String>,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub processing_ms: Option<u64>,
}

impl Job {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            status: JobStatus::Pending,
            classification: None,
            error: None,
            last_analyzed: None,
            processing_ms: None,
        }
    }
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: bool,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(Target::new(3, "https://www.amazon.de/dp/B0"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.classification.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
