//! Job orchestrator.
//!
//! Turns an ordered batch of targets into classified jobs under bounded
//! concurrency, pacing, and pause/stop control. Exactly one run is active
//! at a time; each job is claimed by exactly one worker for its entire
//! processing lifetime, so per-job state transitions are strictly ordered
//! Pending → Processing → {Completed, Error}.

use super::{Job, JobStatus, RunSummary};
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, ScanEvent};
use crate::fetch::{FetchError, Fetcher};
use crate::target::Target;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a scan run is already in progress")]
    AlreadyInProgress,
    #[error("rendering session startup failed: {0}")]
    SessionStartup(String),
}

/// Counter snapshot for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub running: bool,
    pub paused: bool,
    pub queue_depth: usize,
    pub active: usize,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Schedules a batch of targets across a bounded worker set.
#[derive(Clone)]
pub struct Orchestrator {
    fetcher: Arc<dyn Fetcher>,
    cfg: OrchestratorConfig,
    events: Arc<EventBus>,
    jobs: Arc<Mutex<Vec<Job>>>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    paused: Arc<watch::Sender<bool>>,
    stopping: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
    processed: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cfg: OrchestratorConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            fetcher,
            cfg,
            events,
            jobs: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            paused: Arc::new(paused),
            stopping: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            total: Arc::new(AtomicUsize::new(0)),
            processed: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Process a batch. Rejects if a run is already active. Resolves when
    /// the queue is drained and all workers have returned, or after a
    /// `stop`.
    pub async fn run(&self, batch: Vec<Target>) -> Result<RunSummary, RunError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunError::AlreadyInProgress);
        }
        let started = Instant::now();
        self.stopping.store(false, Ordering::SeqCst);
        let _ = self.paused.send_replace(false);
        self.fetcher.reset();
        *self.fatal.lock().await = None;

        // Snapshot the batch in FIFO order. A target appearing twice is
        // enqueued once so overlapping selections never produce duplicate
        // work.
        let mut jobs = Vec::with_capacity(batch.len());
        let mut seen = HashSet::new();
        for target in batch {
            if !seen.insert(target.url.clone()) {
                debug!("skipping duplicate target {}", target.url);
                continue;
            }
            jobs.push(Job::new(target));
        }
        let total = jobs.len();
        *self.jobs.lock().await = jobs;
        *self.queue.lock().await = (0..total).collect();

        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.active.store(0, Ordering::SeqCst);

        let workers = self.cfg.max_concurrency.min(total.max(1));
        info!("run started: {total} target(s), {workers} worker(s)");
        self.events.emit(ScanEvent::RunStarted { total });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = WorkerCtx {
                worker_id,
                fetcher: Arc::clone(&self.fetcher),
                cfg: self.cfg.clone(),
                events: Arc::clone(&self.events),
                jobs: Arc::clone(&self.jobs),
                queue: Arc::clone(&self.queue),
                paused: self.paused.subscribe(),
                stopping: Arc::clone(&self.stopping),
                active: Arc::clone(&self.active),
                processed: Arc::clone(&self.processed),
                succeeded: Arc::clone(&self.succeeded),
                failed: Arc::clone(&self.failed),
                fatal: Arc::clone(&self.fatal),
            };
            handles.push(tokio::spawn(worker_loop(ctx)));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(message) = self.fatal.lock().await.take() {
            self.running.store(false, Ordering::SeqCst);
            return Err(RunError::SessionStartup(message));
        }

        let summary = RunSummary {
            total,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            stopped: self.stopping.load(Ordering::SeqCst),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "run finished: {} succeeded, {} failed, {}ms{}",
            summary.succeeded,
            summary.failed,
            summary.elapsed_ms,
            if summary.stopped { " (stopped)" } else { "" }
        );
        self.events.emit(ScanEvent::RunCompleted {
            succeeded: summary.succeeded,
            failed: summary.failed,
            elapsed_ms: summary.elapsed_ms,
            stopped: summary.stopped,
        });
        self.running.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    /// Stop dequeuing new work. In-flight fetches are not interrupted;
    /// they finish or time out naturally.
    pub fn pause(&self) {
        if self.running.load(Ordering::SeqCst) && !*self.paused.borrow() {
            info!("run paused");
            let _ = self.paused.send_replace(true);
            self.events.emit(ScanEvent::RunPaused);
        }
    }

    pub fn resume(&self) {
        if *self.paused.borrow() {
            info!("run resumed");
            let _ = self.paused.send_replace(false);
            self.events.emit(ScanEvent::RunResumed);
        }
    }

    /// Cooperative stop: clear the remaining queue (those jobs stay
    /// Pending), abandon pending retries, and let in-flight operations
    /// settle. No new work is dispatched afterwards.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!("stop requested: clearing queue");
        self.stopping.store(true, Ordering::SeqCst);
        self.queue.lock().await.clear();
        self.fetcher.abandon_retries();
        // Wake any worker parked in the pause wait so it observes the stop.
        let _ = self.paused.send_replace(false);
        self.events.emit(ScanEvent::RunStopped);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of all jobs in the current or last run.
    pub async fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let running = self.running.load(Ordering::SeqCst);
        let paused = *self.paused.borrow();
        let queue_depth = self.queue.lock().await.len();
        OrchestratorStats {
            running,
            paused,
            queue_depth,
            active: self.active.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

struct WorkerCtx {
    worker_id: usize,
    fetcher: Arc<dyn Fetcher>,
    cfg: OrchestratorConfig,
    events: Arc<EventBus>,
    jobs: Arc<Mutex<Vec<Job>>>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    paused: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    processed: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    fatal: Arc<Mutex<Option<String>>>,
}

async fn worker_loop(mut ctx: WorkerCtx) {
    loop {
        if ctx.stopping.load(Ordering::SeqCst) {
            break;
        }

        // Signal-based pause: park without consuming queue items until
        // resume() or stop() flips the watch value.
        while *ctx.paused.borrow_and_update() {
            if ctx.stopping.load(Ordering::SeqCst) {
                return;
            }
            if ctx.paused.changed().await.is_err() {
                return;
            }
        }
        if ctx.stopping.load(Ordering::SeqCst) {
            break;
        }

        let Some(index) = ctx.queue.lock().await.pop_front() else {
            break;
        };

        let target = {
            let mut jobs = ctx.jobs.lock().await;
            let job = &mut jobs[index];
            job.status = JobStatus::Processing;
            job.target.clone()
        };
        ctx.active.fetch_add(1, Ordering::SeqCst);
        debug!(
            "worker {} processing row {} ({})",
            ctx.worker_id, target.row, target.url
        );
        ctx.events.emit(ScanEvent::JobStarted {
            row: target.row,
            url: target.url.clone(),
        });

        let started = Instant::now();
        let result = ctx.fetcher.fetch(&target).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        ctx.active.fetch_sub(1, Ordering::SeqCst);

        if let Err(FetchError::Startup(message)) = &result {
            // The pipeline is unusable; abort the whole run.
            warn!("aborting run: {message}");
            *ctx.fatal.lock().await = Some(message.clone());
            ctx.stopping.store(true, Ordering::SeqCst);
            ctx.queue.lock().await.clear();
        }

        let (status, classification, error) = match &result {
            Ok(report) => (JobStatus::Completed, Some(report.classification), None),
            Err(e) => (JobStatus::Error, None, Some(e.to_string())),
        };
        {
            let mut jobs = ctx.jobs.lock().await;
            let job = &mut jobs[index];
            job.status = status;
            job.classification = classification;
            job.error = error.clone();
            job.last_analyzed = Some(Utc::now());
            job.processing_ms = Some(elapsed_ms);
        }
        match status {
            JobStatus::Completed => ctx.succeeded.fetch_add(1, Ordering::SeqCst),
            _ => ctx.failed.fetch_add(1, Ordering::SeqCst),
        };
        ctx.processed.fetch_add(1, Ordering::SeqCst);
        ctx.events.emit(ScanEvent::JobFinished {
            row: target.row,
            url: target.url,
            status,
            classification,
            error,
            processing_ms: elapsed_ms,
        });

        // Pacing between items, skipped when there is nothing left to do.
        if !ctx.stopping.load(Ordering::SeqCst) && !ctx.queue.lock().await.is_empty() {
            tokio::time::sleep(ctx.cfg.pacing).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, Diagnostics, Mark};
    use crate::fetch::{FetchResult, PageReport};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Stub fetcher: validates like the real client, then waits for a
    /// semaphore permit before answering.
    struct StubFetcher {
        gate: Semaphore,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        abandoned: AtomicBool,
        fail_transient: bool,
        startup_failure: bool,
    }

    impl StubFetcher {
        fn open() -> Arc<Self> {
            let stub = Self::gated();
            stub.gate.add_permits(10_000);
            stub
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                abandoned: AtomicBool::new(false),
                fail_transient: false,
                startup_failure: false,
            })
        }

        fn report() -> PageReport {
            PageReport {
                classification: Classification {
                    product_fiche: Mark::Yes,
                    energy_label: Mark::Yes,
                    mouseover_label: Mark::No,
                },
                diagnostics: Diagnostics::default(),
                analyzed_at: Utc::now(),
                processing_ms: 1,
            }
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, target: &Target) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            target.validate()?;
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.expect("gate closed");
            drop(permit);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.startup_failure {
                return Err(FetchError::Startup("no browser".to_string()));
            }
            if self.fail_transient {
                return Err(FetchError::Transient("boom".to_string()));
            }
            Ok(Self::report())
        }

        fn abandon_retries(&self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }

        fn reset(&self) {
            self.abandoned.store(false, Ordering::SeqCst);
        }
    }

    fn quick_cfg(concurrency: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: concurrency,
            pacing: Duration::from_millis(1),
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::new(i as u64, format!("https://www.amazon.de/dp/B{i:07}")))
            .collect()
    }

    fn orchestrator(fetcher: Arc<StubFetcher>, concurrency: usize) -> Orchestrator {
        Orchestrator::new(fetcher, quick_cfg(concurrency), Arc::new(EventBus::default()))
    }

    async fn wait_for_calls(stub: &StubFetcher, n: usize) {
        while stub.calls.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_every_job() {
        let stub = StubFetcher::open();
        let orch = orchestrator(Arc::clone(&stub), 3);
        let mut rx = orch.events.subscribe();

        let summary = orch.run(targets(5)).await.unwrap();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 0);
        assert!(!summary.stopped);

        for job in orch.jobs().await {
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.classification.is_some());
            assert!(job.error.is_none());
            assert!(job.last_analyzed.is_some());
        }
        assert!(!orch.is_running());

        let mut finished = 0;
        loop {
            match rx.try_recv() {
                Ok(ScanEvent::JobFinished { .. }) => finished += 1,
                Ok(ScanEvent::RunCompleted { .. }) => break,
                Ok(_) => {}
                Err(e) => panic!("event stream ended early: {e}"),
            }
        }
        assert_eq!(finished, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_respected() {
        let stub = StubFetcher::open();
        let orch = orchestrator(Arc::clone(&stub), 2);

        orch.run(targets(6)).await.unwrap();
        assert!(stub.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_rejected_while_active() {
        let stub = StubFetcher::gated();
        let orch = orchestrator(Arc::clone(&stub), 1);

        let handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(targets(2)).await })
        };
        wait_for_calls(&stub, 1).await;

        let err = orch.run(targets(1)).await.unwrap_err();
        assert!(matches!(err, RunError::AlreadyInProgress));

        stub.gate.add_permits(100);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_new_dispatch_until_resume() {
        let stub = StubFetcher::gated();
        let orch = orchestrator(Arc::clone(&stub), 1);

        let handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(targets(3)).await })
        };
        wait_for_calls(&stub, 1).await;

        orch.pause();
        // Release the in-flight job; it must still complete, but nothing
        // new may be dispatched while paused.
        stub.gate.add_permits(1);
        while orch.stats().await.processed < 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        let jobs = orch.jobs().await;
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(jobs[2].status, JobStatus::Pending);

        orch.resume();
        stub.gate.add_permits(100);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_unconsumed_jobs_pending() {
        let stub = StubFetcher::gated();
        let orch = orchestrator(Arc::clone(&stub), 1);

        let handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(targets(3)).await })
        };
        wait_for_calls(&stub, 1).await;

        orch.stop().await;
        assert!(stub.abandoned.load(Ordering::SeqCst));
        stub.gate.add_permits(100);

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.succeeded + summary.failed, 1);

        let jobs = orch.jobs().await;
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(jobs[2].status, JobStatus::Pending);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_targets_enqueued_once() {
        let stub = StubFetcher::open();
        let orch = orchestrator(Arc::clone(&stub), 2);

        let mut batch = targets(2);
        batch.push(batch[0].clone());
        let summary = orch.run(batch).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_example_scenario_with_one_malformed_target() {
        let stub = StubFetcher::open();
        let orch = orchestrator(Arc::clone(&stub), 2);

        let mut batch = targets(4);
        batch.push(Target::new(99, "not a url"));
        let summary = orch.run(batch).await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);

        let jobs = orch.jobs().await;
        let bad = jobs.iter().find(|j| j.target.row == 99).unwrap();
        assert_eq!(bad.status, JobStatus::Error);
        assert!(bad.error.is_some());
        assert!(bad.classification.is_none());
        assert_eq!(orch.stats().await.processed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_failure_aborts_run() {
        let stub = Arc::new(StubFetcher {
            gate: Semaphore::new(10_000),
            calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            abandoned: AtomicBool::new(false),
            fail_transient: false,
            startup_failure: true,
        });
        let orch = orchestrator(Arc::clone(&stub), 2);

        let err = orch.run(targets(4)).await.unwrap_err();
        assert!(matches!(err, RunError::SessionStartup(_)));
        assert!(!orch.is_running());

        // Jobs never dispatched stayed Pending.
        let jobs = orch.jobs().await;
        assert!(jobs.iter().any(|j| j.status == JobStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_counted_as_failed() {
        let stub = Arc::new(StubFetcher {
            gate: Semaphore::new(10_000),
            calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            abandoned: AtomicBool::new(false),
            fail_transient: true,
            startup_failure: false,
        });
        let orch = orchestrator(Arc::clone(&stub), 2);

        let summary = orch.run(targets(3)).await.unwrap();
        assert_eq!(summary.failed, 3);
        for job in orch.jobs().await {
            assert_eq!(job.status, JobStatus::Error);
            assert!(job.error.is_some());
            assert!(job.classification.is_none());
        }
    }
}
