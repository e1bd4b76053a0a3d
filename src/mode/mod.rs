//! # Launch modes.
//!
//! A [`Launcher`] starts one worker and returns an [`Instance`]: its id, the
//! [`Link`] used to reach it and an [`InstanceControl`] used to stop it. The master
//! picks one launcher at build time and never branches on the mode afterwards.
//!
//! - [`ProcessLauncher`] one OS process per worker, SEQPACKET channel on fd 3.
//! - [`ThreadLauncher`] one Tokio task per worker, in-process channels.
//!
//! Both launchers run the same pump for every worker:
//!
//! ```text
//! worker ──frames──► pump ──► relay (to the master loop)
//!                     │  "listening"      ─► "app-start" {workerId, address}
//!                     │  stream closed    ─► "app-disconnect" {workerId}
//!                     └─ worker exited    ─► "agent-exit" / "app-exit" {code, signal}
//! ```
//!
//! Once an instance is detached the pump keeps draining but relays nothing.

mod process;
mod thread;

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use process::{APP_WORKER_ARG, AGENT_WORKER_ARG, ProcessLauncher, WorkerCommand};
pub use thread::{ThreadLauncher, WorkerFn};

use crate::WorkerId;
use crate::config::{ClusterOptions, StartMode};
use crate::error::ClusterError;
use crate::ipc::{Frame, Link};
use crate::message::{Endpoint, Message};

/// Worker tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    App,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::App => "app",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a launcher needs to start one worker.
pub struct SpawnRequest<'a> {
    pub role: Role,
    /// Supervisor sequence id.
    pub id: u64,
    /// Options blob for this worker.
    pub options: &'a ClusterOptions,
    /// Where the worker's messages and exit notification go.
    pub relay: &'a mpsc::UnboundedSender<Message>,
}

/// A started worker.
pub struct Instance {
    pub worker_id: WorkerId,
    pub link: Link,
    pub control: Box<dyn InstanceControl>,
}

/// Kill side of a started worker.
#[async_trait]
pub trait InstanceControl: Send + Sync + 'static {
    /// Stops relaying the worker's messages and exit notification.
    fn detach(&self);

    /// Asks the worker to stop and forces it after `timeout`.
    async fn terminate(&self, timeout: Duration);
}

/// Capability that starts workers in one launch mode.
pub trait Launcher: Send + Sync + 'static {
    fn mode(&self) -> StartMode;

    /// Starts one worker. Must be called inside a Tokio runtime.
    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Instance, ClusterError>;
}

/// How a worker ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Signal name, e.g. `SIGKILL`.
    pub signal: Option<String>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(name: &str) -> Self {
        Self {
            code: None,
            signal: Some(name.to_string()),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let signal = status.signal().map(|raw| {
            nix::sys::signal::Signal::try_from(raw)
                .map(|sig| sig.as_str().to_string())
                .unwrap_or_else(|_| raw.to_string())
        });
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Time granted to a dead worker's channel to flush its last frames.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Per-worker relay between a worker's frames and the master loop.
pub(crate) struct Pump {
    pub role: Role,
    pub worker_id: WorkerId,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
    pub relay: mpsc::UnboundedSender<Message>,
    pub detached: CancellationToken,
    pub exited: watch::Sender<bool>,
}

impl Pump {
    /// Relays until `exit` resolves, then reports the exit.
    pub(crate) async fn run<F>(mut self, exit: F)
    where
        F: Future<Output = io::Result<WorkerExit>>,
    {
        tokio::pin!(exit);
        let mut connected = true;
        let result = loop {
            tokio::select! {
                frame = self.incoming.recv(), if connected => match frame {
                    Some(frame) => self.forward(frame.message),
                    None => {
                        connected = false;
                        self.disconnected();
                    }
                },
                result = &mut exit => break result,
            }
        };
        let _ = self.exited.send(true);

        if connected {
            let drain = async {
                while let Some(frame) = self.incoming.recv().await {
                    self.forward(frame.message);
                }
            };
            let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;
        }

        let status = result.unwrap_or_else(|err| {
            if self.role == Role::Agent {
                self.emit(
                    Message::new("agent-error")
                        .with_data(json!({ "workerId": self.worker_id, "reason": err.to_string() })),
                );
            }
            WorkerExit::default()
        });
        let action = match self.role {
            Role::Agent => "agent-exit",
            Role::App => "app-exit",
        };
        self.emit(Message::new(action).with_data(json!({
            "workerId": self.worker_id,
            "code": status.code,
            "signal": status.signal,
        })));
    }

    fn forward(&self, mut msg: Message) {
        if self.role == Role::App && msg.action == "listening" {
            match msg.data.take() {
                Some(address) => self.emit(
                    Message::new("app-start")
                        .with_data(json!({ "workerId": self.worker_id, "address": address })),
                ),
                None => tracing::debug!(worker_id = self.worker_id, "[master] listening without address ignored"),
            }
            return;
        }
        msg.from = Some(Endpoint::from(self.role));
        if msg.sender_worker_id.is_none() {
            msg.sender_worker_id = Some(self.worker_id.to_string());
        }
        if !self.detached.is_cancelled() {
            let _ = self.relay.send(msg);
        }
    }

    fn disconnected(&self) {
        if self.role == Role::App {
            self.emit(Message::new("app-disconnect").with_data(json!({ "workerId": self.worker_id })));
        }
    }

    /// Lifecycle notification addressed to the master.
    fn emit(&self, msg: Message) {
        if self.detached.is_cancelled() {
            return;
        }
        let msg = msg.with_from(Endpoint::from(self.role)).with_to(Endpoint::Master);
        let _ = self.relay.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        link: Link,
        relay: mpsc::UnboundedReceiver<Message>,
        detached: CancellationToken,
        exited: watch::Receiver<bool>,
        exit: tokio::sync::oneshot::Sender<WorkerExit>,
    }

    fn harness(role: Role) -> Harness {
        let (link, incoming) = Link::channel();
        let (relay_tx, relay) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(false);
        let (exit, exit_rx) = tokio::sync::oneshot::channel();
        let detached = CancellationToken::new();
        let pump = Pump {
            role,
            worker_id: 7,
            incoming,
            relay: relay_tx,
            detached: detached.clone(),
            exited: exited_tx,
        };
        tokio::spawn(pump.run(async move {
            exit_rx.await.map_err(|_| io::Error::other("dropped"))
        }));
        Harness {
            link,
            relay,
            detached,
            exited,
            exit,
        }
    }

    #[tokio::test]
    async fn test_listening_becomes_app_start() {
        let mut h = harness(Role::App);
        h.link
            .send(Message::new("listening").with_data(json!({ "port": 7001, "addressType": 4 })))
            .unwrap();

        let msg = h.relay.recv().await.unwrap();
        assert_eq!(msg.action, "app-start");
        assert_eq!(msg.to, Some(Endpoint::Master));
        assert_eq!(msg.data, Some(json!({ "workerId": 7, "address": { "port": 7001, "addressType": 4 } })));
    }

    #[tokio::test]
    async fn test_messages_are_stamped_with_sender() {
        let mut h = harness(Role::Agent);
        h.link.send(Message::new("custom").with_to(Endpoint::App)).unwrap();

        let msg = h.relay.recv().await.unwrap();
        assert_eq!(msg.from, Some(Endpoint::Agent));
        assert_eq!(msg.to, Some(Endpoint::App));
        assert_eq!(msg.sender_worker_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_exit_is_reported_after_pending_frames() {
        let mut h = harness(Role::App);
        h.link.send(Message::new("last-words")).unwrap();
        drop(h.link);
        h.exit.send(WorkerExit::signal("SIGKILL")).unwrap();

        let mut actions = Vec::new();
        while let Some(msg) = h.relay.recv().await {
            actions.push(msg.action.clone());
            if msg.action == "app-exit" {
                assert_eq!(msg.data, Some(json!({ "workerId": 7, "code": null, "signal": "SIGKILL" })));
                break;
            }
        }
        assert_eq!(actions.first().map(String::as_str), Some("last-words"));
        assert!(*h.exited.borrow());
    }

    #[tokio::test]
    async fn test_detached_instance_is_silent() {
        let mut h = harness(Role::Agent);
        h.detached.cancel();
        h.link.send(Message::new("agent-start")).unwrap();
        h.exit.send(WorkerExit::code(0)).unwrap();

        h.exited.wait_for(|done| *done).await.unwrap();
        tokio::task::yield_now().await;
        assert!(h.relay.try_recv().is_err());
    }
}
