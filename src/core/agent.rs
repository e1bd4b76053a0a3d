//! # Agent supervisor.
//!
//! Owns the fork and kill side of the single agent slot. Policy (refork or fatal)
//! is decided by the master from the `agent-exit` the pump reports; this type
//! only launches, counts crashes for the refork backoff and terminates.
//!
//! ```text
//! fork() ─► launcher.spawn ─► AgentHandle{status: starting} ─► WorkerManager
//! started() ─► crash counter reset, boot time
//! clean()  ─► detach the dead instance
//! kill(t)  ─► detach, then terminate within t
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ClusterOptions;
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind};
use crate::manager::{AgentHandle, AgentStatus};
use crate::message::Message;
use crate::mode::{InstanceControl, Launcher, Role, SpawnRequest};
use crate::policies::BackoffPolicy;

pub(crate) struct AgentSupervisor {
    launcher: Arc<dyn Launcher>,
    bus: Bus,
    next_id: u64,
    control: Option<Box<dyn InstanceControl>>,
    start_time: Instant,
    crashes: u32,
}

impl AgentSupervisor {
    pub(crate) fn new(launcher: Arc<dyn Launcher>, bus: Bus) -> Self {
        Self {
            launcher,
            bus,
            next_id: 0,
            control: None,
            start_time: Instant::now(),
            crashes: 0,
        }
    }

    /// Launches a new agent.
    pub(crate) fn fork(
        &mut self,
        options: &ClusterOptions,
        relay: &mpsc::UnboundedSender<Message>,
    ) -> Result<AgentHandle, ClusterError> {
        self.next_id += 1;
        let id = self.next_id;
        let instance = self.launcher.spawn(SpawnRequest {
            role: Role::Agent,
            id,
            options,
            relay,
        })?;

        self.start_time = Instant::now();
        self.control = Some(instance.control);
        tracing::info!(
            id,
            worker_id = instance.worker_id,
            mode = self.launcher.mode().as_str(),
            "[master] agent_worker#{}:{} start with clusterPort:{}",
            id,
            instance.worker_id,
            options.cluster_port.map(|p| p.to_string()).unwrap_or_default(),
        );
        self.bus
            .publish(Event::new(EventKind::WorkerForked).with_worker(Role::Agent, id, instance.worker_id));

        Ok(AgentHandle {
            id,
            worker_id: instance.worker_id,
            status: AgentStatus::Starting,
            link: instance.link,
        })
    }

    /// Records a successful boot; returns how long it took.
    pub(crate) fn started(&mut self) -> Duration {
        self.crashes = 0;
        self.start_time.elapsed()
    }

    /// Counts a crash and returns the delay before the next fork with the attempt number.
    pub(crate) fn crashed(&mut self, backoff: &BackoffPolicy) -> (Duration, u32) {
        let delay = backoff.next(self.crashes);
        self.crashes = self.crashes.saturating_add(1);
        (delay, self.crashes)
    }

    /// Forgets the current instance without signalling it.
    pub(crate) fn clean(&mut self) {
        if let Some(control) = self.control.take() {
            control.detach();
        }
    }

    /// Stops the current agent, if any.
    pub(crate) async fn kill(&mut self, timeout: Duration) {
        if let Some(control) = self.control.take() {
            control.detach();
            control.terminate(timeout).await;
        }
    }

    /// Forks so far; the id of the latest agent.
    pub(crate) fn forks(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::StartMode;
    use crate::ipc::Link;
    use crate::mode::Instance;

    #[derive(Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    struct Control(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl InstanceControl for Control {
        fn detach(&self) {
            self.0.lock().unwrap().push("detach");
        }

        async fn terminate(&self, _timeout: Duration) {
            self.0.lock().unwrap().push("terminate");
        }
    }

    impl Launcher for Recording {
        fn mode(&self) -> StartMode {
            StartMode::WorkerThreads
        }

        fn spawn(&self, request: SpawnRequest<'_>) -> Result<Instance, ClusterError> {
            Ok(Instance {
                worker_id: 1000 + request.id as u32,
                link: Link::channel().0,
                control: Box::new(Control(Arc::clone(&self.calls))),
            })
        }
    }

    #[tokio::test]
    async fn test_fork_assigns_sequence_ids() {
        let launcher = Arc::new(Recording::default());
        let mut sup = AgentSupervisor::new(launcher, Bus::new(8));
        let (relay, _rx) = mpsc::unbounded_channel();
        let options = ClusterOptions::default();

        let first = sup.fork(&options, &relay).unwrap();
        let second = sup.fork(&options, &relay).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(second.worker_id, 1002);
        assert_eq!(second.status, AgentStatus::Starting);
        assert_eq!(sup.forks(), 2);
    }

    #[tokio::test]
    async fn test_kill_detaches_before_terminating() {
        let launcher = Arc::new(Recording::default());
        let calls = Arc::clone(&launcher.calls);
        let mut sup = AgentSupervisor::new(launcher, Bus::new(8));
        let (relay, _rx) = mpsc::unbounded_channel();

        sup.fork(&ClusterOptions::default(), &relay).unwrap();
        sup.kill(Duration::from_secs(1)).await;
        sup.kill(Duration::from_secs(1)).await;
        assert_eq!(*calls.lock().unwrap(), vec!["detach", "terminate"]);
    }

    #[test]
    fn test_crash_counter_resets_on_start() {
        let launcher = Arc::new(Recording::default());
        let mut sup = AgentSupervisor::new(launcher, Bus::new(8));
        let backoff = BackoffPolicy::default();

        assert_eq!(sup.crashed(&backoff), (Duration::from_secs(1), 1));
        assert_eq!(sup.crashed(&backoff).1, 2);
        sup.started();
        assert_eq!(sup.crashed(&backoff).1, 1);
    }
}
