//! Scheduler for pairing work units with identities and proxy leases
//!
//! This module handles:
//! - A bounded pool of workers drawing from a shared `WorkQueue`
//! - Skipping units that already succeeded in an earlier run
//! - Pre-request pacing and occasional long pauses
//! - Lease rotation, probabilistic or every K requests
//! - The per-unit attempt loop driven by the `BackoffClassifier`
//! - Cancellation, fatal aborts and the final progress flush
//! - Bounded whole-backlog resubmission of abandoned units

mod backoff;
mod classifier;
mod pacing;
mod report;

pub use backoff::{uniform_ms, BackoffPolicy};
pub use classifier::{BackoffClassifier, Decision};
pub use pacing::Pacing;
pub use report::RunReport;

use crate::config::{BackoffConfig, Config, PacingConfig, SchedulerConfig};
use crate::pool::{IdentityPool, ProxyPool, ReleaseOutcome};
use crate::progress::ProgressStore;
use crate::state::{Identity, Lease};
use crate::transport::{SessionProvider, UnitExecutor};
use crate::work::{FailureKind, ScrapeResult, UnitOutcome, WorkQueue, WorkUnit};
use crate::{Result, SluiceError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Knobs the scheduler reads from the configuration
#[derive(Debug, Clone, Default)]
pub struct SchedulerSettings {
    pub scheduler: SchedulerConfig,
    pub pacing: PacingConfig,
    pub backoff: BackoffConfig,
    /// Chance of rotating the lease before a request
    pub rotate_probability: f64,
    /// Rotate every N requests of a worker (0 disables)
    pub rotate_every: u64,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: config.scheduler.clone(),
            pacing: config.pacing.clone(),
            backoff: config.backoff.clone(),
            rotate_probability: config.proxy.rotate_probability,
            rotate_every: config.proxy.rotate_every,
        }
    }
}

/// How a worker finished with the unit it was holding
enum UnitStep {
    Resolved(ScrapeResult),
    /// Pushed back to the queue for another identity
    Requeued,
    Fatal(ScrapeResult, SluiceError),
}

/// State private to one worker
#[derive(Default)]
struct WorkerState {
    lease: Option<Lease>,
    requests: u64,
}

#[derive(Default)]
struct WorkerReport {
    results: Vec<ScrapeResult>,
    fatal: Option<SluiceError>,
}

/// Runs batches of work units against shared identity and proxy pools
#[derive(Clone)]
pub struct Scheduler {
    settings: Arc<SchedulerSettings>,
    identities: Arc<IdentityPool>,
    proxies: Arc<ProxyPool>,
    executor: Arc<dyn UnitExecutor>,
    sessions: Option<Arc<dyn SessionProvider>>,
    progress: Arc<ProgressStore>,
    classifier: Arc<BackoffClassifier>,
    pacing: Arc<Pacing>,
}

impl Scheduler {
    /// Creates a scheduler over injected pools and collaborators
    ///
    /// # Arguments
    ///
    /// * `settings` - Scheduler, pacing and backoff configuration
    /// * `identities` - The identity pool
    /// * `proxies` - The proxy pool; use `ProxyPool::disabled()` to run without proxies
    /// * `executor` - Performs one unit of work
    /// * `progress` - Durable progress record
    pub fn new(
        settings: SchedulerSettings,
        identities: Arc<IdentityPool>,
        proxies: Arc<ProxyPool>,
        executor: Arc<dyn UnitExecutor>,
        progress: Arc<ProgressStore>,
    ) -> Self {
        let classifier = BackoffClassifier::new(
            settings.backoff.clone(),
            settings.scheduler.max_attempts,
        );
        let pacing = Pacing::new(settings.pacing.clone());
        Self {
            settings: Arc::new(settings),
            identities,
            proxies,
            executor,
            sessions: None,
            progress,
            classifier: Arc::new(classifier),
            pacing: Arc::new(pacing),
        }
    }

    /// Enables session refresh on the second failed attempt of a unit
    pub fn with_session_provider(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn classifier(&self) -> &BackoffClassifier {
        &self.classifier
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Runs `units` to completion with `concurrency` workers
    pub async fn run(&self, units: Vec<WorkUnit>, concurrency: usize) -> Result<RunReport> {
        self.run_with_cancellation(units, concurrency, CancellationToken::new())
            .await
    }

    /// Runs `units` until they all resolve or `cancel` fires
    ///
    /// Units that already succeeded are reported as skipped and never
    /// dispatched. On cancellation, units that did not resolve are recorded
    /// as pending. Progress is flushed before returning on every path.
    /// Block events and the network failure counter start from zero on
    /// every call.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - One result per distinct unit id
    /// * `Err(SluiceError)` - A fatal condition aborted the run
    pub async fn run_with_cancellation(
        &self,
        units: Vec<WorkUnit>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.classifier.reset().await;
        self.dispatch(units, concurrency, cancel).await
    }

    /// Works through one batch without touching run-wide backoff state
    async fn dispatch(
        &self,
        units: Vec<WorkUnit>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        let mut backlog = Vec::new();

        for unit in units {
            if !seen.insert(unit.id.clone()) {
                continue;
            }
            if self.progress.is_done(&unit.id).await {
                tracing::debug!("Skipping {} (already succeeded)", unit.id);
                results.push(ScrapeResult {
                    unit_id: unit.id,
                    attempts: 0,
                    outcome: UnitOutcome::Skipped,
                });
            } else {
                backlog.push(unit);
            }
        }

        let queue = Arc::new(WorkQueue::new());
        let queued = queue.push_batch(backlog).await;
        let concurrency = concurrency.max(1);
        tracing::info!(
            "Dispatching {} units with {} workers ({} already done)",
            queued,
            concurrency,
            results.len()
        );

        let worker_cancel = cancel.child_token();
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let scheduler = self.clone();
            let queue = Arc::clone(&queue);
            let cancel = worker_cancel.clone();
            workers.spawn(async move { scheduler.worker_loop(worker_id, queue, cancel).await });
        }

        let mut fatal = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    results.extend(report.results);
                    if let Some(e) = report.fatal {
                        if fatal.is_none() {
                            tracing::error!("Aborting run: {}", e);
                            worker_cancel.cancel();
                            fatal = Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Worker task failed: {}", e);
                    worker_cancel.cancel();
                }
            }
        }

        for unit in queue.drain().await {
            self.progress.record_pending(&unit.id).await;
            results.push(ScrapeResult {
                unit_id: unit.id,
                attempts: unit.attempt,
                outcome: UnitOutcome::Interrupted,
            });
        }

        let flushed = self.progress.flush().await;
        if let Some(e) = fatal {
            if let Err(flush_err) = flushed {
                tracing::error!("Failed to flush progress after abort: {}", flush_err);
            }
            return Err(e);
        }
        flushed?;

        let report = RunReport::new(results);
        tracing::info!(
            "Run finished in {:?}: {} succeeded, {} failed, {} abandoned, {} skipped, {} interrupted",
            started.elapsed(),
            report.succeeded(),
            report.failed(),
            report.abandoned(),
            report.skipped(),
            report.interrupted()
        );
        Ok(report)
    }

    /// Runs `units`, then resubmits abandoned units as fresh submissions
    ///
    /// At most `resubmit-rounds` extra rounds run, each after a uniform pause.
    /// Resubmitted units start again at attempt 1; per-unit backoff does not
    /// carry over between rounds. The rounds belong to the same run, so block
    /// events keep counting toward the ceiling.
    pub async fn run_with_resubmission(
        &self,
        units: Vec<WorkUnit>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let catalog: HashMap<String, WorkUnit> = units
            .iter()
            .map(|unit| (unit.id.clone(), unit.clone()))
            .collect();
        let mut report = self
            .run_with_cancellation(units, concurrency, cancel.clone())
            .await?;

        let config = &self.settings.scheduler;
        for round in 1..=config.resubmit_rounds {
            let abandoned: Vec<WorkUnit> = report
                .abandoned_ids()
                .filter_map(|id| catalog.get(id))
                .map(|unit| unit.clone().resubmitted())
                .collect();
            if abandoned.is_empty() || cancel.is_cancelled() {
                break;
            }

            let pause = uniform_ms(
                config.resubmit_pause_min_secs * 1000,
                config.resubmit_pause_max_secs * 1000,
            );
            tracing::info!(
                "Resubmitting {} abandoned units (round {}/{}) in {:.0}s",
                abandoned.len(),
                round,
                config.resubmit_rounds,
                pause.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }

            let retried = self
                .dispatch(abandoned, concurrency, cancel.clone())
                .await?;
            report.merge(retried);
        }

        Ok(report)
    }

    async fn worker_loop(
        self,
        worker_id: usize,
        queue: Arc<WorkQueue>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut worker = WorkerState::default();

        loop {
            let unit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.next() => match next {
                    Some(unit) => unit,
                    None => break,
                },
            };

            // A resubmitted duplicate may have succeeded meanwhile
            if self.progress.is_done(&unit.id).await {
                queue.complete(&unit.id).await;
                report.results.push(ScrapeResult {
                    unit_id: unit.id,
                    attempts: 0,
                    outcome: UnitOutcome::Skipped,
                });
                continue;
            }

            match self.process_unit(unit, &queue, &mut worker, &cancel).await {
                UnitStep::Resolved(result) => report.results.push(result),
                UnitStep::Requeued => {}
                UnitStep::Fatal(result, e) => {
                    report.results.push(result);
                    report.fatal = Some(e);
                    break;
                }
            }
        }

        tracing::debug!(
            "Worker {} stopped after {} requests",
            worker_id,
            worker.requests
        );
        report
    }

    /// Drives one unit through its attempts
    ///
    /// Attempts of a unit run strictly one after another. A hard block
    /// hands the unit back to the queue so another identity picks it up.
    async fn process_unit(
        &self,
        mut unit: WorkUnit,
        queue: &WorkQueue,
        worker: &mut WorkerState,
        cancel: &CancellationToken,
    ) -> UnitStep {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return self.interrupt(unit, queue).await,
                _ = self.classifier.wait_if_paused() => {}
            }

            let identity = tokio::select! {
                _ = cancel.cancelled() => return self.interrupt(unit, queue).await,
                selected = self.identities.select() => match selected {
                    Ok(identity) => identity,
                    Err(e) => return self.abort(unit, queue, e).await,
                },
            };

            self.rotate_lease(worker).await;

            let delay = self.pacing.delay_before(identity.request_count);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.identities.release(&identity.id, ReleaseOutcome::Neutral).await;
                    return self.interrupt(unit, queue).await;
                }
                _ = sleep(delay) => {}
            }

            let attempt = self.execute(&identity, worker, &unit).await;
            worker.requests += 1;

            let failure = match attempt {
                Ok(items) => {
                    self.identities
                        .release(&identity.id, ReleaseOutcome::Success)
                        .await;
                    self.classifier.record_success().await;
                    if let Err(e) = self.progress.record_success(&unit.id, items).await {
                        tracing::error!("Failed to record success of {}: {}", unit.id, e);
                    }
                    queue.complete(&unit.id).await;
                    tracing::debug!(
                        "Unit {} succeeded on attempt {} ({} items)",
                        unit.id,
                        unit.attempt,
                        items
                    );
                    return UnitStep::Resolved(ScrapeResult {
                        unit_id: unit.id,
                        attempts: unit.attempt,
                        outcome: UnitOutcome::Succeeded { items },
                    });
                }
                Err(failure) => failure,
            };

            tracing::warn!(
                "Unit {} attempt {} failed as {}: {}",
                unit.id,
                unit.attempt,
                identity.id,
                failure
            );
            self.identities
                .release(&identity.id, ReleaseOutcome::for_failure(&failure))
                .await;
            if let Some(lease) = &worker.lease {
                if failure.is_network() && self.proxies.report_failure(lease).await {
                    worker.lease = None;
                }
            }
            if failure.is_block() {
                worker.lease = None;
            }

            match self.classifier.classify(&unit, &failure).await {
                Decision::Retry {
                    delay,
                    refresh_session,
                    rotate_proxy,
                } => {
                    self.progress.record_retry().await;
                    if refresh_session {
                        self.refresh_session(&identity).await;
                    }
                    if rotate_proxy {
                        worker.lease = None;
                    }
                    tracing::debug!("Retrying {} in {:?}", unit.id, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return self.interrupt(unit, queue).await,
                        _ = sleep(delay) => {}
                    }
                    unit = unit.next_attempt();
                }
                Decision::CoolDown { refresh_session } => {
                    self.progress.record_retry().await;
                    if refresh_session {
                        self.refresh_session(&identity).await;
                    }
                    queue.requeue(unit.next_attempt()).await;
                    return UnitStep::Requeued;
                }
                Decision::Abandon => return self.give_up(unit, queue, failure).await,
                Decision::Fatal(e) => return self.abort(unit, queue, e).await,
            }
        }
    }

    /// One bounded call to the executor
    async fn execute(
        &self,
        identity: &Identity,
        worker: &WorkerState,
        unit: &WorkUnit,
    ) -> std::result::Result<u64, FailureKind> {
        tracing::debug!(
            "Executing {} {} (attempt {}) as {}{}",
            unit.kind,
            unit.id,
            unit.attempt,
            identity.id,
            worker
                .lease
                .as_ref()
                .map(|lease| format!(" via {}", lease.endpoint))
                .unwrap_or_default()
        );
        let call = self
            .executor
            .execute(identity, worker.lease.as_ref(), unit);
        match timeout(self.settings.scheduler.request_timeout(), call).await {
            Ok(result) => result.map(|output| output.items),
            Err(_) => Err(FailureKind::Timeout),
        }
    }

    /// Picks a new lease when the worker has none, on schedule, or by chance
    async fn rotate_lease(&self, worker: &mut WorkerState) {
        if !self.proxies.is_enabled() {
            return;
        }

        let expired = worker
            .lease
            .as_ref()
            .is_some_and(|lease| lease.is_expired(Instant::now()));
        let scheduled = self.settings.rotate_every > 0
            && worker.requests > 0
            && worker.requests % self.settings.rotate_every == 0;
        let by_chance = self.settings.rotate_probability > 0.0
            && rand::random_bool(self.settings.rotate_probability.min(1.0));

        if worker.lease.is_none() || expired || scheduled || by_chance {
            worker.lease = self.proxies.acquire().await;
            if let Some(lease) = &worker.lease {
                tracing::trace!("Rotated to lease {}", lease.endpoint);
            }
        }
    }

    async fn refresh_session(&self, identity: &Identity) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        if let Err(e) = self
            .identities
            .refresh_session(&identity.id, sessions.as_ref())
            .await
        {
            tracing::warn!("Session refresh for {} failed: {}", identity.id, e);
        }
    }

    /// Records a unit that ran out of attempts or was rejected
    async fn give_up(&self, unit: WorkUnit, queue: &WorkQueue, failure: FailureKind) -> UnitStep {
        if let Err(e) = self.progress.record_failure(&unit.id).await {
            tracing::error!("Failed to record failure of {}: {}", unit.id, e);
        }
        queue.complete(&unit.id).await;

        let outcome = match failure {
            FailureKind::Rejected(_) => UnitOutcome::Failed { failure },
            last => UnitOutcome::Abandoned { last },
        };
        tracing::warn!(
            "Giving up on {} after {} attempts",
            unit.id,
            unit.attempt
        );
        UnitStep::Resolved(ScrapeResult {
            unit_id: unit.id,
            attempts: unit.attempt,
            outcome,
        })
    }

    /// Records a unit left unresolved by cancellation
    async fn interrupt(&self, unit: WorkUnit, queue: &WorkQueue) -> UnitStep {
        UnitStep::Resolved(self.leave_pending(unit, queue).await)
    }

    async fn abort(&self, unit: WorkUnit, queue: &WorkQueue, error: SluiceError) -> UnitStep {
        UnitStep::Fatal(self.leave_pending(unit, queue).await, error)
    }

    async fn leave_pending(&self, unit: WorkUnit, queue: &WorkQueue) -> ScrapeResult {
        self.progress.record_pending(&unit.id).await;
        queue.complete(&unit.id).await;
        ScrapeResult {
            unit_id: unit.id,
            attempts: unit.attempt,
            outcome: UnitOutcome::Interrupted,
        }
    }
}
