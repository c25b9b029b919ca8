//! Result store: transient job state plus the final result, keyed by job id.
//!
//! Writes are gated on `JobState::rank`, so a record only ever moves forward and
//! the first terminal write is the one that sticks. Terminal records expire
//! `ttl` after they finish.

use crate::error::StoreError;
use crate::types::{ExecutionResult, JobId, JobRecord, JobState};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record a newly submitted job. An existing record for the id is left alone.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Advance a job to a non-terminal state. Returns `false` when the
    /// transition would move the job backwards or out of a terminal state.
    async fn record_state(&self, job_id: JobId, state: JobState) -> Result<bool, StoreError>;

    /// Store the terminal result. Returns `false` if the job already had one.
    async fn put(&self, result: ExecutionResult) -> Result<bool, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError>;

    /// Purge terminal records older than the TTL, returning how many went.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;
}

struct Entry {
    record: JobRecord,
    expires_at: Option<Instant>,
}

/// In-process store sharded by job id.
pub struct MemoryStore {
    shards: Vec<RwLock<HashMap<JobId, Entry>>>,
    ttl: Duration,
}

const DEFAULT_SHARDS: usize = 16;

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_shards(ttl, DEFAULT_SHARDS)
    }

    pub fn with_shards(ttl: Duration, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, job_id: &JobId) -> &RwLock<HashMap<JobId, Entry>> {
        let idx = (job_id.as_u128() % self.shards.len() as u128) as usize;
        &self.shards[idx]
    }

    fn read(&self, job_id: &JobId) -> RwLockReadGuard<'_, HashMap<JobId, Entry>> {
        self.shard(job_id).read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, job_id: &JobId) -> RwLockWriteGuard<'_, HashMap<JobId, Entry>> {
        self.shard(job_id).write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let job_id = record.job_id;
        self.write(&job_id).entry(job_id).or_insert(Entry {
            record,
            expires_at: None,
        });
        Ok(())
    }

    async fn record_state(&self, job_id: JobId, state: JobState) -> Result<bool, StoreError> {
        if state.is_terminal() {
            return Ok(false);
        }
        let mut shard = self.write(&job_id);
        let entry = shard.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if !entry.record.state.can_transition_to(state) {
            return Ok(false);
        }
        entry.record.state = state;
        entry.record.updated_at = Utc::now();
        Ok(true)
    }

    async fn put(&self, result: ExecutionResult) -> Result<bool, StoreError> {
        let job_id = result.job_id;
        let mut shard = self.write(&job_id);
        let entry = shard.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if entry.record.state.is_terminal() {
            return Ok(false);
        }
        entry.record.state = result.state;
        entry.record.updated_at = result.finished_at;
        entry.record.result = Some(result);
        entry.expires_at = Some(Instant::now() + self.ttl);
        Ok(true)
    }

    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.read(&job_id)
            .get(&job_id)
            .map(|entry| entry.record.clone())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
            removed += before - shard.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept expired job records");
        }
        Ok(removed)
    }
}
