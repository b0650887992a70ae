use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DuelId;
use crate::utils::time::unix_millis;

pub const FINISH_JOBS_KEY: &str = "duel:finish-jobs";

/// Delayed request to finish a duel whose opponent stopped answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishDuelJob {
    pub job_id: Uuid,
    pub duel_id: DuelId,
    pub attempt: u32,
}

impl FinishDuelJob {
    pub fn new(duel_id: DuelId) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            duel_id,
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Delayed-job facility with at-least-once delivery.
///
/// A job leaves the queue only through [`JobQueue::ack`]. Jobs handed out by
/// `take_due` are leased: they stay stored and are handed out again once the
/// lease runs out.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stores `job` to become due after `delay`. Replaces a stored job with the
    /// same `job_id`.
    async fn schedule(&self, job: FinishDuelJob, delay: Duration) -> Result<()>;

    /// Leases up to `limit` due jobs for `lease`.
    async fn take_due(&self, limit: usize, lease: Duration) -> Result<Vec<FinishDuelJob>>;

    /// Removes a handled job.
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

fn due_at(delay: Duration) -> Result<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).context("Job delay out of range")?;
    Ok(Utc::now() + delay)
}

/// Picks due members, pushes their score to the lease deadline and returns
/// `id, payload` pairs. Members without a payload are purged on the way.
const LEASE_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for _, id in ipairs(ids) do
  local payload = redis.call('HGET', KEYS[2], id)
  if payload then
    redis.call('ZADD', KEYS[1], 'XX', ARGV[3], id)
    table.insert(out, id)
    table.insert(out, payload)
  else
    redis.call('ZREM', KEYS[1], id)
  end
end
return out
"#;

/// Sorted set of job ids scored by due time in milliseconds, plus a hash of
/// job payloads.
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    key: String,
    payloads_key: String,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            key: FINISH_JOBS_KEY.to_string(),
            payloads_key: format!("{}:payloads", FINISH_JOBS_KEY),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn schedule(&self, job: FinishDuelJob, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(&job).context("Failed to serialize finish job")?;
        let member = job.job_id.to_string();
        let score = unix_millis(due_at(delay)?);
        let mut conn = self.redis.clone();

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.payloads_key)
            .arg(&member)
            .arg(&payload)
            .ignore()
            .cmd("ZADD")
            .arg(&self.key)
            .arg(score)
            .arg(&member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to schedule finish job in Redis")?;

        tracing::debug!(duel_id = %job.duel_id, due_ms = score, "finish job scheduled");
        Ok(())
    }

    async fn take_due(&self, limit: usize, lease: Duration) -> Result<Vec<FinishDuelJob>> {
        let mut conn = self.redis.clone();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).context("Job lease out of range")?;
        let lease_until = unix_millis(now + lease);

        let leased: Vec<String> = redis::Script::new(LEASE_DUE_SCRIPT)
            .key(&self.key)
            .key(&self.payloads_key)
            .arg(unix_millis(now))
            .arg(limit)
            .arg(lease_until)
            .invoke_async(&mut conn)
            .await
            .context("Failed to lease due finish jobs in Redis")?;

        let mut jobs = Vec::with_capacity(leased.len() / 2);
        for pair in leased.chunks_exact(2) {
            let (member, payload) = (&pair[0], &pair[1]);
            match serde_json::from_str::<FinishDuelJob>(payload) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    tracing::warn!(error = %err, payload = %payload, "Dropping malformed finish job");
                    self.remove(&mut conn, member).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.redis.clone();
        self.remove(&mut conn, &job_id.to_string()).await
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }
}

impl RedisJobQueue {
    async fn remove(&self, conn: &mut ConnectionManager, member: &str) -> Result<()> {
        redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.key)
            .arg(member)
            .ignore()
            .cmd("HDEL")
            .arg(&self.payloads_key)
            .arg(member)
            .ignore()
            .query_async::<()>(conn)
            .await
            .context("Failed to remove finish job from Redis")?;
        Ok(())
    }
}

/// In-process queue for the memory backend and tests.
#[derive(Default)]
pub struct LocalJobQueue {
    jobs: Mutex<Vec<(DateTime<Utc>, FinishDuelJob)>>,
}

impl LocalJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored job, due, leased or waiting.
    pub fn pending(&self) -> Vec<FinishDuelJob> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().map(|(_, job)| job.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<(DateTime<Utc>, FinishDuelJob)>>> {
        self.jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("local job queue lock poisoned"))
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn schedule(&self, job: FinishDuelJob, delay: Duration) -> Result<()> {
        let due = due_at(delay)?;
        let mut jobs = self.lock()?;
        jobs.retain(|(_, stored)| stored.job_id != job.job_id);
        jobs.push((due, job));
        Ok(())
    }

    async fn take_due(&self, limit: usize, lease: Duration) -> Result<Vec<FinishDuelJob>> {
        let now = Utc::now();
        let lease_until = due_at(lease)?;
        let mut jobs = self.lock()?;

        jobs.sort_by_key(|(due, _)| *due);
        let mut leased = Vec::new();
        for (due, job) in jobs.iter_mut() {
            if leased.len() == limit || *due > now {
                break;
            }
            *due = lease_until;
            leased.push(job.clone());
        }
        Ok(leased)
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        self.lock()?.retain(|(_, job)| job.job_id != job_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
