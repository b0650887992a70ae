use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::{
    config::DuelConfig,
    metrics::{record_timeout_job, DUEL_WORKER_TICKS_TOTAL},
    services::{
        job_queue::{FinishDuelJob, JobQueue},
        timeout_finisher::{FinishOutcome, TimeoutFinisher},
    },
};

/// Attempts per job before it is dropped.
pub const MAX_JOB_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Drains due timeout jobs and runs the finisher for each. A periodic sweep
/// finishes overdue duels whose job never made it into the queue.
pub struct TimeoutWorker {
    finisher: Arc<TimeoutFinisher>,
    jobs: Arc<dyn JobQueue>,
    config: DuelConfig,
}

impl TimeoutWorker {
    pub fn new(finisher: Arc<TimeoutFinisher>, jobs: Arc<dyn JobQueue>, config: DuelConfig) -> Self {
        Self {
            finisher,
            jobs,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = self.config.worker_poll_interval();
        let sweep_interval = self.config.sweep_interval();
        info!(
            "Starting duel timeout worker (interval={}ms, sweep={}s)",
            interval.as_millis(),
            sweep_interval.as_secs()
        );

        let mut next_sweep = Instant::now() + sweep_interval;
        loop {
            match self.run_once().await {
                Ok(_) => {
                    DUEL_WORKER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                }
                Err(err) => {
                    DUEL_WORKER_TICKS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!(error = %err, "duel timeout worker tick failed");
                }
            }

            if Instant::now() >= next_sweep {
                if let Err(err) = self.sweep().await {
                    warn!(error = %err, "overdue duel sweep failed");
                }
                next_sweep = Instant::now() + sweep_interval;
            }

            sleep(interval).await;
        }
    }

    /// Processes one batch of due jobs and returns how many were taken.
    ///
    /// Only fetching the batch can fail; per-job errors are logged and the job
    /// stays leased until it is retried.
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self
            .jobs
            .take_due(self.config.worker_batch_size, self.config.job_lease())
            .await?;
        let taken = batch.len();

        for job in batch {
            match self.finisher.finish_by_timeout(job.duel_id).await {
                Ok(outcome) => {
                    record_timeout_job(match outcome {
                        FinishOutcome::Finished => "finished",
                        FinishOutcome::Skipped => "skipped",
                    });
                    self.acknowledge(&job).await;
                }
                Err(err) => {
                    record_timeout_job("failed");
                    self.retry_or_drop(job, &err.to_string()).await;
                }
            }
        }

        Ok(taken)
    }

    /// Finishes active duels that are past their deadline by more than one
    /// job lease. Returns how many were finished.
    pub async fn sweep(&self) -> Result<usize> {
        let overdue = self.finisher.overdue_duels(self.config.job_lease()).await?;
        let mut finished = 0;
        for duel_id in overdue {
            match self.finisher.finish_by_timeout(duel_id).await {
                Ok(FinishOutcome::Finished) => {
                    record_timeout_job("recovered");
                    warn!(%duel_id, "Finished overdue duel without a timeout job");
                    finished += 1;
                }
                Ok(FinishOutcome::Skipped) => {}
                Err(err) => {
                    warn!(%duel_id, error = %err, "Failed to finish overdue duel");
                }
            }
        }
        Ok(finished)
    }

    async fn acknowledge(&self, job: &FinishDuelJob) {
        if let Err(err) = self.jobs.ack(job.job_id).await {
            // redelivered after the lease; the finisher skips it then
            warn!(duel_id = %job.duel_id, error = %err, "Failed to acknowledge timeout job");
        }
    }

    async fn retry_or_drop(&self, job: FinishDuelJob, err: &str) {
        let retry = job.next_attempt();
        if retry.attempt >= MAX_JOB_ATTEMPTS {
            error!(
                duel_id = %job.duel_id,
                attempts = retry.attempt,
                error = %err,
                "Giving up on timeout finisher job"
            );
            self.acknowledge(&job).await;
            return;
        }

        warn!(
            duel_id = %job.duel_id,
            attempt = retry.attempt,
            error = %err,
            "Timeout finisher job failed, rescheduling"
        );
        if let Err(schedule_err) = self.jobs.schedule(retry, RETRY_DELAY).await {
            warn!(
                duel_id = %job.duel_id,
                error = %schedule_err,
                "Failed to reschedule timeout job, it returns when the lease expires"
            );
        }
    }
}
