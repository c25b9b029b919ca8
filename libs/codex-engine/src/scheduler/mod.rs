//! Job queue and scheduler.
//!
//! Submissions are admitted under a single mutex that guards the fair queue,
//! the live-job table and the per-tenant in-flight counters. The mutex is never
//! held across an await. A dispatcher task takes a slot permit, pops the next
//! job round-robin across tenants, and spawns its lifecycle holding the permit.

pub mod queue;

use crate::error::SchedulerError;
use crate::executor::{self, Progress};
use crate::metrics;
use crate::sandbox::Sandbox;
use async_trait::async_trait;
use chrono::Utc;
use codex_common::config::ServiceConfig;
use codex_common::registry::RuntimeRegistry;
use codex_common::store::ResultStore;
use codex_common::types::{
    ExecutionResult, Job, JobId, JobRecord, JobState, Language, LimitCeiling, LimitOverrides, TenantId,
    TerminalReason, MIN_MEMORY_MB,
};
use queue::FairQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub tenant_inflight_limit: usize,
    pub max_queue_depth: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub ceiling: LimitCeiling,
    pub watchdog_slack: Duration,
}

impl From<&ServiceConfig> for SchedulerConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            tenant_inflight_limit: config.tenant_inflight_limit,
            max_queue_depth: config.max_queue_depth,
            max_source_bytes: config.max_source_bytes,
            max_stdin_bytes: config.max_stdin_bytes,
            ceiling: config.ceiling,
            watchdog_slack: config.watchdog_slack,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the queue before it started.
    Cancelled,
    /// Running; the sandbox was told to kill it. Its terminal state is
    /// whichever lands first.
    Signalled,
    /// Already terminal; nothing changed.
    AlreadyFinished,
}

struct LiveJob {
    job: Arc<Job>,
    cancel: CancellationToken,
    state: JobState,
    queued: bool,
    dispatched: bool,
    /// The tenant's in-flight count no longer includes this job.
    released: bool,
    watch: watch::Sender<JobState>,
}

#[derive(Default)]
struct State {
    queue: FairQueue,
    live: HashMap<JobId, LiveJob>,
    inflight: HashMap<TenantId, usize>,
}

impl State {
    fn release(&mut self, tenant: &TenantId) {
        if let Some(count) = self.inflight.get_mut(tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.inflight.remove(tenant);
            }
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<RuntimeRegistry>,
    sandbox: Arc<Sandbox>,
    store: Arc<dyn ResultStore>,
    state: Mutex<State>,
    slots: Arc<Semaphore>,
    notify: Notify,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

enum CancelAction {
    Dequeued,
    Pending,
    Signalled,
    NotLive,
}

impl Scheduler {
    /// Build the scheduler and spawn its dispatcher on the current runtime.
    pub fn start(
        config: SchedulerConfig,
        registry: Arc<RuntimeRegistry>,
        sandbox: Arc<Sandbox>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let inner = Arc::new(Inner {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            registry,
            sandbox,
            store,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(dispatch_loop(inner.clone()));
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.inner.store
    }

    /// Jobs waiting for a slot.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Validate and enqueue a submission. Returns as soon as the job is queued.
    #[instrument(skip_all, fields(tenant = %tenant, language = %request.language))]
    pub async fn submit(&self, tenant: &TenantId, request: SubmitRequest) -> Result<JobId, SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let job = match inner.validate(tenant, request) {
            Ok(job) => Arc::new(job),
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };
        let job_id = job.id;

        let (tx, _) = watch::channel(JobState::Queued);
        {
            let mut state = inner.lock();
            let in_flight = state.inflight.get(tenant).copied().unwrap_or(0);
            if in_flight >= inner.config.tenant_inflight_limit {
                let err = SchedulerError::RateLimited {
                    tenant: tenant.clone(),
                    in_flight,
                    limit: inner.config.tenant_inflight_limit,
                };
                reject(&err);
                return Err(err);
            }
            if state.queue.len() >= inner.config.max_queue_depth {
                let err = SchedulerError::ResourceExhausted(format!(
                    "queue is full ({} jobs waiting)",
                    state.queue.len()
                ));
                reject(&err);
                return Err(err);
            }
            *state.inflight.entry(tenant.clone()).or_insert(0) += 1;
            state.live.insert(
                job_id,
                LiveJob {
                    job: job.clone(),
                    cancel: CancellationToken::new(),
                    state: JobState::Queued,
                    queued: false,
                    dispatched: false,
                    released: false,
                    watch: tx,
                },
            );
        }

        if let Err(e) = inner.store.insert(JobRecord::queued(&job)).await {
            let mut state = inner.lock();
            state.live.remove(&job_id);
            state.release(tenant);
            return Err(e.into());
        }

        let cancelled_meanwhile = {
            let mut state = inner.lock();
            let State { queue, live, .. } = &mut *state;
            match live.get_mut(&job_id) {
                Some(entry) if !entry.cancel.is_cancelled() => {
                    entry.queued = true;
                    queue.push(tenant, job_id);
                    metrics::QUEUE_DEPTH.set(queue.len() as i64);
                    false
                }
                _ => true,
            }
        };
        if cancelled_meanwhile {
            inner.finalize(ExecutionResult::cancelled(job_id)).await;
        } else {
            inner.notify.notify_one();
        }

        let language = job.language.to_string();
        metrics::JOBS_SUBMITTED.with_label_values(&[language.as_str()]).inc();
        info!(job_id = %job_id, source_bytes = job.source.len(), "Job queued");
        Ok(job_id)
    }

    /// Best-effort cancellation.
    #[instrument(skip_all, fields(tenant = %tenant, job_id = %job_id))]
    pub async fn cancel(&self, tenant: &TenantId, job_id: JobId) -> Result<CancelOutcome, SchedulerError> {
        let inner = &self.inner;
        let action = {
            let mut state = inner.lock();
            let State { queue, live, .. } = &mut *state;
            match live.get_mut(&job_id) {
                None => CancelAction::NotLive,
                Some(entry) if entry.job.tenant != *tenant => return Err(SchedulerError::JobNotFound(job_id)),
                Some(entry) => {
                    entry.cancel.cancel();
                    if entry.dispatched {
                        CancelAction::Signalled
                    } else if entry.queued && queue.remove(tenant, job_id) {
                        entry.queued = false;
                        metrics::QUEUE_DEPTH.set(queue.len() as i64);
                        CancelAction::Dequeued
                    } else {
                        // Still being admitted; `submit` finalizes it.
                        CancelAction::Pending
                    }
                }
            }
        };

        match action {
            CancelAction::Dequeued => {
                inner.finalize(ExecutionResult::cancelled(job_id)).await;
                info!(job_id = %job_id, "Queued job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            CancelAction::Pending => Ok(CancelOutcome::Cancelled),
            CancelAction::Signalled => {
                info!(job_id = %job_id, "Cancellation signalled to running job");
                Ok(CancelOutcome::Signalled)
            }
            CancelAction::NotLive => {
                let record = inner.owned_record(tenant, job_id).await?;
                if record.state.is_terminal() {
                    return Ok(CancelOutcome::AlreadyFinished);
                }
                // Left behind by an earlier process; nothing will ever run it.
                warn!(job_id = %job_id, state = %record.state, "Cancelling orphaned job record");
                inner.store.put(ExecutionResult::cancelled(job_id)).await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    pub async fn status(&self, tenant: &TenantId, job_id: JobId) -> Result<JobRecord, SchedulerError> {
        self.inner.owned_record(tenant, job_id).await
    }

    /// Like `status`, but waits up to `timeout` for the job to finish.
    pub async fn wait(&self, tenant: &TenantId, job_id: JobId, timeout: Duration) -> Result<JobRecord, SchedulerError> {
        let inner = &self.inner;
        let record = inner.owned_record(tenant, job_id).await?;
        if record.state.is_terminal() || timeout.is_zero() {
            return Ok(record);
        }

        let receiver = inner.lock().live.get(&job_id).map(|entry| entry.watch.subscribe());
        if let Some(mut receiver) = receiver {
            let _ = tokio::time::timeout(timeout, receiver.wait_for(|state| state.is_terminal())).await;
        }
        inner.owned_record(tenant, job_id).await
    }

    /// Periodically purge expired results until shutdown.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
                match inner.store.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Expired job records purged"),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            }
        })
    }

    /// Stop dispatching, cancel every live job and wait up to `grace` for
    /// running sandboxes to be torn down.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let dequeued: Vec<JobId> = {
            let mut state = inner.lock();
            let State { queue, live, .. } = &mut *state;
            let mut dequeued = Vec::new();
            for (job_id, entry) in live.iter_mut() {
                entry.cancel.cancel();
                if entry.queued && !entry.dispatched && queue.remove(&entry.job.tenant, *job_id) {
                    entry.queued = false;
                    dequeued.push(*job_id);
                }
            }
            metrics::QUEUE_DEPTH.set(queue.len() as i64);
            dequeued
        };
        for job_id in dequeued {
            inner.finalize(ExecutionResult::cancelled(job_id)).await;
        }

        let slots = inner.config.max_concurrent_jobs as u32;
        match tokio::time::timeout(grace, inner.slots.acquire_many(slots)).await {
            Ok(_) => info!("All sandboxes drained"),
            Err(_) => warn!(grace_ms = grace.as_millis() as u64, "Sandboxes still running after grace period"),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn validate(&self, tenant: &TenantId, request: SubmitRequest) -> Result<Job, SchedulerError> {
        let language: Language = request.language.parse()?;
        let profile = self.registry.profile_for(language)?;

        if request.source.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("source is empty".to_string()));
        }
        if request.source.len() > self.config.max_source_bytes {
            return Err(SchedulerError::InvalidRequest(format!(
                "source is {} bytes, limit is {}",
                request.source.len(),
                self.config.max_source_bytes
            )));
        }
        if request.stdin.len() > self.config.max_stdin_bytes {
            return Err(SchedulerError::InvalidRequest(format!(
                "stdin is {} bytes, limit is {}",
                request.stdin.len(),
                self.config.max_stdin_bytes
            )));
        }
        if let Some(memory_mb) = request.limits.memory_mb.filter(|mb| *mb < MIN_MEMORY_MB) {
            return Err(SchedulerError::InvalidRequest(format!(
                "memory_mb is {}, minimum is {}",
                memory_mb, MIN_MEMORY_MB
            )));
        }

        Ok(Job {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            language,
            source: request.source,
            stdin: request.stdin,
            submitted_at: Utc::now(),
            limits: profile.limits.with_overrides(&request.limits, &self.config.ceiling),
        })
    }

    async fn owned_record(&self, tenant: &TenantId, job_id: JobId) -> Result<JobRecord, SchedulerError> {
        let record = self.store.get(job_id).await?;
        if record.tenant != *tenant {
            return Err(SchedulerError::JobNotFound(job_id));
        }
        Ok(record)
    }

    /// Pop the next job round-robin and mark it dispatched.
    fn next_job(&self) -> Option<(Arc<Job>, CancellationToken)> {
        let mut state = self.lock();
        let State { queue, live, .. } = &mut *state;
        while let Some((_, job_id)) = queue.pop() {
            if let Some(entry) = live.get_mut(&job_id) {
                entry.queued = false;
                entry.dispatched = true;
                metrics::QUEUE_DEPTH.set(queue.len() as i64);
                return Some((entry.job.clone(), entry.cancel.clone()));
            }
        }
        metrics::QUEUE_DEPTH.set(0);
        None
    }

    /// Free the tenant's in-flight slot, store the terminal result, then drop
    /// the job and wake waiters. A client that sees the result can submit again.
    async fn finalize(&self, result: ExecutionResult) {
        let job_id = result.job_id;
        let reason = result.reason;
        {
            let mut state = self.lock();
            let tenant = state.live.get_mut(&job_id).filter(|entry| !entry.released).map(|entry| {
                entry.released = true;
                entry.job.tenant.clone()
            });
            if let Some(tenant) = tenant {
                state.release(&tenant);
            }
        }

        let final_state = match self.store.put(result).await {
            Ok(true) => reason.state(),
            Ok(false) => {
                debug!(job_id = %job_id, "Job already had a terminal result");
                self.store.get(job_id).await.map(|r| r.state).unwrap_or(reason.state())
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to persist job result");
                reason.state()
            }
        };

        {
            let mut state = self.lock();
            if let Some(entry) = state.live.remove(&job_id) {
                entry.watch.send_replace(final_state);
            }
        }

        let state_label = final_state.to_string();
        metrics::JOBS_FINISHED
            .with_label_values(&[state_label.as_str(), reason.as_str()])
            .inc();
        info!(job_id = %job_id, state = %final_state, reason = %reason, "Job finished");
    }

    async fn run_job(self: Arc<Self>, job: Arc<Job>, cancel: CancellationToken) -> ExecutionResult {
        let profile = match self.registry.profile_for(job.language) {
            Ok(profile) => profile,
            Err(e) => return ExecutionResult::failed(job.id, TerminalReason::InternalError, e.to_string()),
        };
        let slack = self.config.watchdog_slack;
        executor::execute(&self.sandbox, &job, profile, &cancel, self.as_ref(), slack).await
    }
}

#[async_trait]
impl Progress for Inner {
    async fn advance(&self, job_id: JobId, next: JobState) -> bool {
        {
            let mut state = self.lock();
            let Some(entry) = state.live.get_mut(&job_id) else {
                return false;
            };
            if entry.cancel.is_cancelled() || !entry.state.can_transition_to(next) {
                return false;
            }
            entry.state = next;
            entry.watch.send_replace(next);
        }

        if let Err(e) = self.store.record_state(job_id, next).await {
            warn!(job_id = %job_id, state = %next, error = %e, "Failed to record job state");
        }
        debug!(job_id = %job_id, state = %next, "Job advanced");
        true
    }
}

fn reject(err: &SchedulerError) {
    let reason = match err {
        SchedulerError::UnsupportedLanguage(_) => "unsupported_language",
        SchedulerError::InvalidRequest(_) => "invalid_request",
        SchedulerError::RateLimited { .. } => "rate_limited",
        SchedulerError::ResourceExhausted(_) => "resource_exhausted",
        _ => "other",
    };
    metrics::SUBMISSIONS_REJECTED.with_label_values(&[reason]).inc();
    debug!(error = %err, "Submission rejected");
}

async fn dispatch_loop(inner: Arc<Inner>) {
    info!(slots = inner.config.max_concurrent_jobs, "Dispatcher started");
    loop {
        let permit = tokio::select! {
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };

        let next = loop {
            if let Some(next) = inner.next_job() {
                break Some(next);
            }
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = inner.shutdown.cancelled() => break None,
            }
        };
        let Some((job, cancel)) = next else { break };

        debug!(job_id = %job.id, tenant = %job.tenant, "Dispatching job");
        tokio::spawn(run_lifecycle(inner.clone(), job, cancel, permit));
    }
    info!("Dispatcher stopped");
}

async fn run_lifecycle(inner: Arc<Inner>, job: Arc<Job>, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
    metrics::BUSY_SLOTS.inc();
    let started = Instant::now();
    let job_id = job.id;

    // A panic inside the lifecycle still has to end the job.
    let result = match tokio::spawn(inner.clone().run_job(job, cancel)).await {
        Ok(result) => result,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job lifecycle panicked");
            ExecutionResult::failed(job_id, TerminalReason::InternalError, "internal error while executing job")
        }
    };

    inner.finalize(result).await;
    metrics::JOB_DURATION.observe(started.elapsed().as_secs_f64());
    metrics::BUSY_SLOTS.dec();
    drop(permit);
}
