//! # Worker registry and health check.
//!
//! [`WorkerManager`] is the master's single view of who is alive: at most one
//! [`AgentHandle`] plus the [`AppHandle`]s in fork order. It is only ever mutated
//! from the master loop, so it carries no locking.
//!
//! [`HealthCheck`] owns the periodic ticker and the consecutive-failure counter:
//!
//! ```text
//! every interval ─► on_tick() ─► (master) count() ─► observe(count)
//!                                                       │
//!            agent > 0 && worker > 0 ─► failures = 0    │
//!            otherwise               ─► failures += 1 ──┤
//!                                                       ▼
//!                              failures == threshold ─► stop ticker, Some(count)
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::WorkerId;
use crate::ipc::Link;

/// Agent slot status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Started,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Started => "started",
        })
    }
}

/// App worker lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    None,
    Starting,
    Listening,
    Disconnected,
    Dead,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AppState::None => "none",
            AppState::Starting => "starting",
            AppState::Listening => "listening",
            AppState::Disconnected => "disconnected",
            AppState::Dead => "dead",
        })
    }
}

/// The agent as seen by the master.
#[derive(Clone, Debug)]
pub struct AgentHandle {
    /// Supervisor sequence id.
    pub id: u64,
    pub worker_id: WorkerId,
    pub status: AgentStatus,
    pub link: Link,
}

/// An app worker as seen by the master.
#[derive(Clone, Debug)]
pub struct AppHandle {
    /// Supervisor sequence id.
    pub id: u64,
    pub worker_id: WorkerId,
    pub state: AppState,
    /// Set while starting and during shutdown.
    pub disable_refork: bool,
    /// Set when the worker is being replaced on purpose; its death is not an error.
    pub is_dev_reload: bool,
    /// Port the worker was started for (worker_threads mode).
    pub port: Option<u16>,
    pub link: Link,
}

/// Alive counts reported by [`WorkerManager::count`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCount {
    pub agent: usize,
    pub worker: usize,
}

/// Registry of the agent and app handles.
#[derive(Debug, Default)]
pub struct WorkerManager {
    agent: Option<AgentHandle>,
    workers: Vec<AppHandle>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_agent(&mut self, agent: AgentHandle) {
        self.agent = Some(agent);
    }

    pub fn agent(&self) -> Option<&AgentHandle> {
        self.agent.as_ref()
    }

    pub fn agent_mut(&mut self) -> Option<&mut AgentHandle> {
        self.agent.as_mut()
    }

    pub fn delete_agent(&mut self) -> Option<AgentHandle> {
        self.agent.take()
    }

    /// Inserts or replaces the handle with the same worker id.
    pub fn set_worker(&mut self, worker: AppHandle) {
        match self.workers.iter_mut().find(|w| w.worker_id == worker.worker_id) {
            Some(slot) => *slot = worker,
            None => self.workers.push(worker),
        }
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<&AppHandle> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    pub fn worker_mut(&mut self, worker_id: WorkerId) -> Option<&mut AppHandle> {
        self.workers.iter_mut().find(|w| w.worker_id == worker_id)
    }

    pub fn delete_worker(&mut self, worker_id: WorkerId) -> Option<AppHandle> {
        let at = self.workers.iter().position(|w| w.worker_id == worker_id)?;
        Some(self.workers.remove(at))
    }

    pub fn workers(&self) -> impl Iterator<Item = &AppHandle> {
        self.workers.iter()
    }

    pub fn workers_mut(&mut self) -> impl Iterator<Item = &mut AppHandle> {
        self.workers.iter_mut()
    }

    /// Every registered app worker id, in fork order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.worker_id).collect()
    }

    /// Ids of app workers currently in the `listening` state.
    pub fn listening_worker_ids(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.state == AppState::Listening)
            .map(|w| w.worker_id)
            .collect()
    }

    /// The agent counts only once started; every registered app worker counts.
    pub fn count(&self) -> WorkerCount {
        let agent = match &self.agent {
            Some(a) if a.status == AgentStatus::Started => 1,
            _ => 0,
        };
        WorkerCount {
            agent,
            worker: self.workers.len(),
        }
    }
}

/// Periodic "is anything alive" check.
#[derive(Debug)]
pub struct HealthCheck {
    interval: Duration,
    threshold: u32,
    failures: u32,
    ticker: Option<CancellationToken>,
}

impl HealthCheck {
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self {
            interval,
            threshold: threshold.max(1),
            failures: 0,
            ticker: None,
        }
    }

    /// Spawns the ticker; `on_tick` runs once per interval, first after one interval.
    ///
    /// Restarting replaces the previous ticker.
    pub fn start<F, Fut>(&mut self, on_tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => on_tick().await,
                }
            }
        });
        self.ticker = Some(token);
    }

    /// Records one tick. Returns the counts once the failure threshold is reached,
    /// after stopping the ticker.
    pub fn observe(&mut self, count: WorkerCount) -> Option<WorkerCount> {
        if count.agent > 0 && count.worker > 0 {
            self.failures = 0;
            return None;
        }
        self.failures += 1;
        tracing::warn!(
            agent = count.agent,
            worker = count.worker,
            failures = self.failures,
            "[master] health check failed"
        );
        if self.failures >= self.threshold {
            self.stop();
            return Some(count);
        }
        None
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.stop();
    }
}
