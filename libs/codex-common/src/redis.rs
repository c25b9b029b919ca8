use crate::error::StoreError;
use crate::store::ResultStore;
use crate::types::{ExecutionResult, JobId, JobRecord, JobState};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// Redis key layout - API and engine share it so keys stay deterministic.
pub const JOB_PREFIX: &str = "codex:job";

/// Generate the record key for a job
pub fn job_key(job_id: &JobId) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Write the record only if its rank moves forward.
/// Returns -1 when the job is unknown, 0 when the write was refused, 1 when stored.
const ADVANCE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'rank')
if not current then return -1 end
if tonumber(current) >= tonumber(ARGV[1]) then return 0 end
redis.call('HSET', KEYS[1], 'rank', ARGV[1], 'record', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'rank', ARGV[1], 'record', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// Result store backed by Redis hashes.
///
/// Expiry is delegated to Redis: live records carry `live_ttl` so abandoned
/// jobs do not linger forever, terminal records carry `result_ttl`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    result_ttl: Duration,
    live_ttl: Duration,
    advance: Script,
    insert: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, result_ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, result_ttl))
    }

    pub fn new(conn: ConnectionManager, result_ttl: Duration) -> Self {
        Self {
            conn,
            result_ttl,
            live_ttl: Duration::from_secs(86_400),
            advance: Script::new(ADVANCE_SCRIPT),
            insert: Script::new(INSERT_SCRIPT),
        }
    }

    async fn write(&self, record: &JobRecord, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let stored: i64 = self
            .advance
            .key(job_key(&record.job_id))
            .arg(record.state.rank())
            .arg(payload)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(stored)
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&record)?;
        let _: i64 = self
            .insert
            .key(job_key(&record.job_id))
            .arg(record.state.rank())
            .arg(payload)
            .arg(self.live_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_state(&self, job_id: JobId, state: JobState) -> Result<bool, StoreError> {
        if state.is_terminal() {
            return Ok(false);
        }
        let mut record = self.get(job_id).await?;
        record.state = state;
        record.updated_at = Utc::now();
        match self.write(&record, self.live_ttl).await? {
            -1 => Err(StoreError::JobNotFound(job_id)),
            stored => Ok(stored == 1),
        }
    }

    async fn put(&self, result: ExecutionResult) -> Result<bool, StoreError> {
        let job_id = result.job_id;
        let mut record = self.get(job_id).await?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        record.state = result.state;
        record.updated_at = result.finished_at;
        record.result = Some(result);
        match self.write(&record, self.result_ttl).await? {
            -1 => Err(StoreError::JobNotFound(job_id)),
            stored => Ok(stored == 1),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.hget(job_key(&job_id), "record").await?;
        match payload {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        // Redis expires keys on its own.
        Ok(0)
    }
}
