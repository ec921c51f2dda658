//! Periodic maintenance jobs.
//!
//! Every job run holds the shared job lock, so no two jobs (and no two runs
//! of one job) overlap. Failures of single items are counted and logged;
//! they never abort the rest of the batch.

use super::error::{EngineError, EngineResult};
use super::Vaultr;
use crate::metrics::{DEAD_VAULTS_RECLAIMED, JOB_DURATION, JOB_RUNS};
use pinfold_core::{JOB_LOCK, POPULAR_INDEX_SIZE, USERS_LOCK, VAULTS_LOCK, VaultKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The background jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    PopularIndex,
    UserDiskUsage,
    DeadVaults,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::PopularIndex, Job::UserDiskUsage, Job::DeadVaults];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::PopularIndex => "popular_index",
            Job::UserDiskUsage => "user_disk_usage",
            Job::DeadVaults => "dead_vaults",
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Job::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| format!("unknown job: {s}"))
    }
}

/// One entry of the popularity index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularEntry {
    pub key: VaultKey,
    pub num_peers: usize,
}

/// Outcome of a job run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job: Job,
    pub processed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Tally {
    processed: usize,
    failed: usize,
}

impl Vaultr {
    /// Run `job` now, waiting for the job lock first.
    pub async fn run_job(self: &Arc<Self>, job: Job) -> EngineResult<JobReport> {
        let _guard = self.locks.acquire(JOB_LOCK).await;
        let started = Instant::now();
        info!(job = job.as_str(), "Job started");

        let outcome = match job {
            Job::PopularIndex => self.popular_index_pass(),
            Job::UserDiskUsage => self.user_disk_usage_pass().await,
            Job::DeadVaults => self.dead_vaults_pass().await,
        };

        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        JOB_DURATION
            .with_label_values(&[job.as_str()])
            .observe(elapsed.as_secs_f64());

        match outcome {
            Ok(tally) => {
                JOB_RUNS.with_label_values(&[job.as_str(), "ok"]).inc();
                info!(
                    job = job.as_str(),
                    processed = tally.processed,
                    failed = tally.failed,
                    elapsed_ms,
                    "Job finished"
                );
                Ok(JobReport {
                    job,
                    processed: tally.processed,
                    failed: tally.failed,
                    elapsed_ms,
                })
            }
            Err(e) => {
                JOB_RUNS.with_label_values(&[job.as_str(), "error"]).inc();
                error!(job = job.as_str(), error = %e, elapsed_ms, "Job failed");
                Err(e)
            }
        }
    }

    /// Rank loaded vaults by peer count and keep the top entries.
    pub async fn compute_popular_index(self: &Arc<Self>) -> EngineResult<JobReport> {
        self.run_job(Job::PopularIndex).await
    }

    /// Recompute disk usage and flocking for every user.
    pub async fn compute_all_user_disk_usage_and_flock(
        self: &Arc<Self>,
    ) -> EngineResult<JobReport> {
        self.run_job(Job::UserDiskUsage).await
    }

    /// Destroy vaults nobody hosts anymore.
    pub async fn delete_dead_vaults(self: &Arc<Self>) -> EngineResult<JobReport> {
        self.run_job(Job::DeadVaults).await
    }

    /// The last computed popularity index, most peers first.
    pub fn popular_vaults(&self) -> Vec<PopularEntry> {
        self.popular
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn popular_index_pass(&self) -> EngineResult<Tally> {
        let handles = self.registry.handles();
        let mut entries: Vec<PopularEntry> = handles
            .iter()
            .map(|handle| PopularEntry {
                key: *handle.key(),
                num_peers: handle.archive().num_remote_peers() + 1,
            })
            .collect();
        entries.sort_by(|a, b| b.num_peers.cmp(&a.num_peers).then_with(|| a.key.cmp(&b.key)));
        entries.truncate(POPULAR_INDEX_SIZE);

        let processed = handles.len();
        *self
            .popular
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries;
        Ok(Tally {
            processed,
            failed: 0,
        })
    }

    async fn user_disk_usage_pass(self: &Arc<Self>) -> EngineResult<Tally> {
        let users = self.metadata.list_users().await?;
        let results = futures::future::join_all(
            users
                .iter()
                .map(|user| self.compute_user_disk_usage_and_flock(user)),
        )
        .await;

        let mut tally = Tally::default();
        for (user, result) in users.iter().zip(results) {
            tally.processed += 1;
            if let Err(e) = result {
                tally.failed += 1;
                warn!(user_id = %user.id, error = %e, "User disk usage recompute failed");
            }
        }
        Ok(tally)
    }

    async fn dead_vaults_pass(&self) -> EngineResult<Tally> {
        let keys = self.metadata.list_dead_vault_keys().await?;
        let mut tally = Tally::default();
        for key in keys {
            tally.processed += 1;
            match self.reclaim_dead_vault(&key).await {
                Ok(true) => info!(vault = %key, "Dead vault deleted"),
                Ok(false) => debug!(vault = %key, "Vault is hosted again, kept"),
                Err(e) => {
                    tally.failed += 1;
                    warn!(vault = %key, error = %e, "Dead vault cleanup failed");
                }
            }
        }
        Ok(tally)
    }

    /// Close a dead vault, delete its directory, then its record. The record
    /// survives a failed directory removal so the next run retries it.
    async fn reclaim_dead_vault(&self, key: &VaultKey) -> EngineResult<bool> {
        let _guards = self.locks.acquire_all(&[USERS_LOCK, VAULTS_LOCK]).await;

        if let Some(record) = self.metadata.get_vault(key).await?
            && !record.hosting_users.is_empty()
        {
            return Ok(false);
        }

        self.close_vault(key).await?;
        self.storage.remove_dir(key).await?;
        self.metadata.delete_vault(key).await?;
        DEAD_VAULTS_RECLAIMED.inc();
        Ok(true)
    }

    /// Spawn one loop per job on its configured interval. Loops end at
    /// shutdown; a failed run is logged and the loop continues.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let jobs = &self.config.jobs;
        [
            (Job::PopularIndex, jobs.popular_index_interval()),
            (Job::UserDiskUsage, jobs.user_disk_usage_interval()),
            (Job::DeadVaults, jobs.dead_vaults_interval()),
        ]
        .into_iter()
        .map(|(job, period)| self.spawn_job_loop(job, period))
        .collect()
    }

    fn spawn_job_loop(self: &Arc<Self>, job: Job, period: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(job = job.as_str(), interval_secs = period.as_secs(), "Job scheduled");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        // Outcome is logged and counted by run_job.
                        let _: Result<_, EngineError> = engine.run_job(job).await;
                    }
                }
            }
            debug!(job = job.as_str(), "Job loop stopped");
        })
    }
}
