//! # App worker supervisor.
//!
//! Owns the fork and kill side of the app worker pool plus the boot counters the
//! master reads:
//!
//! ```text
//! fork_all()  ─► one worker per configured slot (per port in worker_threads mode)
//!                 every handle starts with disable_refork = true
//! record_start(worker_id) ─► start_success_count += 1 (once per worker, until all started)
//! refork(handle)          ─► policy enabled? ─► rate window allows? ─► fork_one()
//! kill(t)                 ─► disable_refork on every handle, terminate all in parallel
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::WorkerId;
use crate::config::{ClusterOptions, StartMode};
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind};
use crate::manager::{AppHandle, AppState, WorkerManager};
use crate::message::Message;
use crate::mode::{InstanceControl, Launcher, Role, SpawnRequest};
use crate::policies::{ReforkPolicy, ReforkWindow};

/// Verdict for a crashed app worker in steady state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Refork {
    /// Replace it now.
    Allowed,
    /// Refork disabled for this worker or in this environment.
    Disabled,
    /// The rate limit is exhausted.
    Refused,
}

pub(crate) struct AppSupervisor {
    launcher: Arc<dyn Launcher>,
    bus: Bus,
    next_id: u64,
    controls: HashMap<WorkerId, Box<dyn InstanceControl>>,
    start_time: Instant,
    start_success_count: usize,
    all_started: bool,
    counted: HashSet<WorkerId>,
    policy: ReforkPolicy,
    window: ReforkWindow,
}

impl AppSupervisor {
    pub(crate) fn new(launcher: Arc<dyn Launcher>, bus: Bus, policy: ReforkPolicy) -> Self {
        Self {
            launcher,
            bus,
            next_id: 0,
            controls: HashMap::new(),
            start_time: Instant::now(),
            start_success_count: 0,
            all_started: false,
            counted: HashSet::new(),
            window: ReforkWindow::new(&policy),
            policy,
        }
    }

    /// Launches the whole pool.
    pub(crate) fn fork_all(
        &mut self,
        options: &ClusterOptions,
        relay: &mpsc::UnboundedSender<Message>,
    ) -> Result<Vec<AppHandle>, ClusterError> {
        self.start_time = Instant::now();
        self.start_success_count = 0;
        tracing::debug!(
            workers = options.workers,
            mode = self.launcher.mode().as_str(),
            "[master] start appWorker"
        );
        worker_options(options)
            .iter()
            .map(|opts| self.fork_one(opts, relay))
            .collect()
    }

    /// Launches one worker with `options`.
    pub(crate) fn fork_one(
        &mut self,
        options: &ClusterOptions,
        relay: &mpsc::UnboundedSender<Message>,
    ) -> Result<AppHandle, ClusterError> {
        self.next_id += 1;
        let id = self.next_id;
        let instance = self.launcher.spawn(SpawnRequest {
            role: Role::App,
            id,
            options,
            relay,
        })?;

        self.controls.insert(instance.worker_id, instance.control);
        tracing::debug!(
            id,
            worker_id = instance.worker_id,
            port = options.port,
            "[master] app_worker#{}:{} start, current workers: {:?}",
            id,
            instance.worker_id,
            self.controls.keys().collect::<Vec<_>>(),
        );
        self.bus
            .publish(Event::new(EventKind::WorkerForked).with_worker(Role::App, id, instance.worker_id));

        Ok(AppHandle {
            id,
            worker_id: instance.worker_id,
            state: AppState::Starting,
            disable_refork: true,
            is_dev_reload: false,
            port: options.port,
            link: instance.link,
        })
    }

    /// Counts a worker that reached its listening address.
    ///
    /// Returns `false` for a worker already counted.
    pub(crate) fn record_start(&mut self, worker_id: WorkerId) -> bool {
        if !self.counted.insert(worker_id) {
            return false;
        }
        if !self.all_started {
            self.start_success_count += 1;
        }
        true
    }

    pub(crate) fn start_success_count(&self) -> usize {
        self.start_success_count
    }

    pub(crate) fn all_started(&self) -> bool {
        self.all_started
    }

    pub(crate) fn mark_all_started(&mut self) {
        self.all_started = true;
    }

    /// Time since the pool was forked.
    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether a worker that died in steady state is replaced.
    pub(crate) fn refork(&mut self, handle: &AppHandle, production: bool) -> Refork {
        if handle.disable_refork || !self.policy.is_enabled(production) {
            return Refork::Disabled;
        }
        if self.window.allow(Instant::now()) {
            Refork::Allowed
        } else {
            Refork::Refused
        }
    }

    /// Drops the bookkeeping of a dead worker.
    pub(crate) fn forget(&mut self, worker_id: WorkerId) {
        if let Some(control) = self.controls.remove(&worker_id) {
            control.detach();
        }
        self.counted.remove(&worker_id);
    }

    /// Terminates `worker_ids` in the background; their exits are still reported.
    pub(crate) fn retire(&mut self, worker_ids: &[WorkerId], timeout: Duration) {
        let controls: Vec<_> = worker_ids
            .iter()
            .filter_map(|id| self.controls.remove(id))
            .collect();
        tokio::spawn(async move {
            join_all(controls.iter().map(|c| c.terminate(timeout))).await;
        });
    }

    /// Stops every worker in parallel.
    pub(crate) async fn kill(&mut self, workers: &mut WorkerManager, timeout: Duration) {
        for worker in workers.workers_mut() {
            worker.disable_refork = true;
        }
        let controls: Vec<_> = self.controls.drain().map(|(_, c)| c).collect();
        for control in &controls {
            control.detach();
        }
        join_all(controls.iter().map(|c| c.terminate(timeout))).await;
    }
}

/// Options of every app worker: one per port in worker_threads mode, otherwise
/// `workers` copies.
pub(crate) fn worker_options(options: &ClusterOptions) -> Vec<ClusterOptions> {
    match options.start_mode {
        StartMode::WorkerThreads => options
            .ports
            .iter()
            .map(|port| ClusterOptions {
                port: Some(*port),
                ..options.clone()
            })
            .collect(),
        StartMode::Process => vec![options.clone(); options.workers],
    }
}
