// Copyright 2026 Labelscan Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scan event bus — typed events from every component.
//!
//! A `tokio::sync::broadcast` channel carrying [`ScanEvent`] values. The
//! SSE endpoint, log sinks, and tests subscribe independently; when no
//! subscriber exists, events are silently dropped.

use crate::classify::Classification;
use crate::job::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the scanner emits. Serialized to JSON for the SSE feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanEvent {
    // ── Run lifecycle ─────────────────────
    RunStarted {
        total: usize,
    },
    RunPaused,
    RunResumed,
    RunStopped,
    RunCompleted {
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
        stopped: bool,
    },

    // ── Per-job updates ───────────────────
    JobStarted {
        row: u64,
        url: String,
    },
    JobFinished {
        row: u64,
        url: String,
        status: JobStatus,
        classification: Option<Classification>,
        error: Option<String>,
        processing_ms: u64,
    },

    // ── Session lifecycle ─────────────────
    SessionStarted,
    SessionClosed {
        reason: String,
    },
}

/// The central event bus.
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if none.
    pub fn emit(&self, event: ScanEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
