use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;

use crate::discovery::RoundOutcome;
use crate::error::{DiscoveryError, Result};
use crate::ports::PolicyStore;

/// Each worker's lifecycle: `Start` is a no-op if already `Running`.
/// `Stop` transitions to `Stopping`; the current round completes before
/// the worker returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
}

/// Anything the `Scheduler` can periodically trigger: `NetworkDiscovery`
/// and `SystemDiscovery` both implement this directly.
#[async_trait]
pub trait DiscoveryWorker: Send + Sync {
    async fn run_round(&self) -> Result<RoundOutcome>;
}

#[async_trait]
impl<L, C, S> DiscoveryWorker for crate::discovery::NetworkDiscovery<L, C, S>
where
    L: crate::ports::LogSource,
    C: crate::ports::ClusterSource,
    S: PolicyStore,
{
    async fn run_round(&self) -> Result<RoundOutcome> {
        crate::discovery::NetworkDiscovery::run_round(self).await
    }
}

#[async_trait]
impl<L, S> DiscoveryWorker for crate::discovery::SystemDiscovery<L, S>
where
    L: crate::ports::LogSource,
    S: PolicyStore,
{
    async fn run_round(&self) -> Result<RoundOutcome> {
        crate::discovery::SystemDiscovery::run_round(self).await
    }
}

#[async_trait]
impl<C, S> DiscoveryWorker for crate::discovery::AdmissionWorker<C, S>
where
    C: crate::ports::ClusterSource,
    S: PolicyStore,
{
    async fn run_round(&self) -> Result<RoundOutcome> {
        crate::discovery::AdmissionWorker::run_round(self).await
    }
}

struct WorkerHandle {
    schedule: Schedule,
    worker: Arc<dyn DiscoveryWorker>,
    state: Arc<tokio::sync::RwLock<WorkerState>>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A process-wide cron trigger and per-worker lifecycle (start/stop/status),
/// plus an optional purge job against a `PolicyStore`.
pub struct Scheduler {
    workers: HashMap<String, WorkerHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Registers a worker under `name` (one of `network`/`system`/
    /// `consumer`/`admission`) with the given crontab cadence.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        worker: Arc<dyn DiscoveryWorker>,
        cron_expr: &str,
    ) -> Result<()> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| DiscoveryError::ConfigError(format!("invalid cron expression: {e}")))?;
        self.workers.insert(
            name.into(),
            WorkerHandle {
                schedule,
                worker,
                state: Arc::new(tokio::sync::RwLock::new(WorkerState::Idle)),
                task: tokio::sync::Mutex::new(None),
            },
        );
        Ok(())
    }

    pub async fn status(&self, kind: &str) -> Result<WorkerState> {
        let handle = self.worker(kind)?;
        Ok(*handle.state.read().await)
    }

    /// No-op if the worker is already `Running`.
    pub async fn start(&self, kind: &str) -> Result<()> {
        let handle = self.worker(kind)?;
        {
            let mut state = handle.state.write().await;
            if *state == WorkerState::Running {
                return Ok(());
            }
            *state = WorkerState::Running;
        }

        let worker = handle.worker.clone();
        let state = handle.state.clone();
        let schedule = handle.schedule.clone();
        let kind = kind.to_string();

        let join = tokio::spawn(async move {
            loop {
                if *state.read().await == WorkerState::Stopping {
                    break;
                }
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let now = Utc::now();
                if next > now {
                    let wait = (next - now)
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(0));
                    tokio::time::sleep(wait).await;
                }
                if *state.read().await == WorkerState::Stopping {
                    break;
                }
                match worker.run_round().await {
                    Ok(outcome) => tracing::info!(
                        worker = %kind,
                        read = outcome.records_read,
                        applied = outcome.candidates_applied,
                        "round complete"
                    ),
                    Err(err) if err.aborts_round() => {
                        tracing::warn!(worker = %kind, error = %err, "round aborted")
                    }
                    Err(err) => tracing::warn!(worker = %kind, error = %err, "round failed"),
                }
            }
            *state.write().await = WorkerState::Idle;
        });

        *handle.task.lock().await = Some(join);
        Ok(())
    }

    /// Transitions to `Stopping`; the in-flight round completes before
    /// the worker task returns the state to `Idle`.
    pub async fn stop(&self, kind: &str) -> Result<()> {
        let handle = self.worker(kind)?;
        let mut state = handle.state.write().await;
        if *state == WorkerState::Running {
            *state = WorkerState::Stopping;
        }
        Ok(())
    }

    fn worker(&self, kind: &str) -> Result<&WorkerHandle> {
        self.workers
            .get(kind)
            .ok_or_else(|| DiscoveryError::ConfigError(format!("unknown worker kind: {kind}")))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// A standalone purge job: fires on its own cadence and calls
/// `PolicyStore::purge` plus the log store's purge.
pub async fn run_purge_once<S: PolicyStore, L: crate::ports::LogSource>(
    store: &S,
    logs: &L,
    retain_for: chrono::Duration,
) -> Result<(u64, u64)> {
    let cutoff = Utc::now() - retain_for;
    let policies_removed = store.purge(cutoff).await?;
    let logs_removed = logs.purge(cutoff).await?;
    Ok((policies_removed, logs_removed))
}
