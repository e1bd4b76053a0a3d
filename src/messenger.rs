//! # Message routing between parent, master, agent and app workers.
//!
//! ```text
//!              ┌────────┐
//!              │ parent │
//!             /└────────┘\
//!            /     │      \
//!           /  ┌────────┐  \
//!          /   │ master │   \
//!         /    └────────┘    \
//!        /     /        \     \
//!      ┌───────┐         ┌───────┐
//!      │ agent │ ─────── │  app  │
//!      └───────┘         └───────┘
//! ```
//!
//! Routing of one message:
//! 1. `from` defaults to `master`.
//! 2. `receiverPid` wins over `to`: the master pid routes to master, the agent's
//!    worker id to agent, anything else to app.
//! 3. Missing `to` follows the default route of `from` (agent→app, app→agent,
//!    parent→master).
//! 4. App delivery fans out to every connected app worker, or only the one named
//!    by `receiverPid`.
//!
//! Messages without a destination and parent messages without a parent are dropped.

use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::ipc::Link;
use crate::manager::{AppState, WorkerManager};
use crate::message::{Endpoint, Message};

/// Connection to whoever launched the master.
#[derive(Clone, Debug)]
pub enum ParentLink {
    /// Parent process reached over an inherited channel.
    Ipc(Link),
    /// Embedding code in the same process.
    Channel(mpsc::UnboundedSender<Message>),
}

impl ParentLink {
    fn send(&self, msg: Message) -> Result<(), IpcError> {
        match self {
            ParentLink::Ipc(link) => link.send(msg),
            ParentLink::Channel(tx) => tx.send(msg).map_err(|_| IpcError::Closed),
        }
    }
}

/// Routes messages; owned by the master loop.
#[derive(Debug)]
pub struct Messenger {
    pid: String,
    master: mpsc::UnboundedSender<Message>,
    parent: Option<ParentLink>,
}

impl Messenger {
    /// `master` receives every message addressed to the master itself.
    pub fn new(pid: u32, master: mpsc::UnboundedSender<Message>, parent: Option<ParentLink>) -> Self {
        Self {
            pid: pid.to_string(),
            master,
            parent,
        }
    }

    #[cfg(test)]
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn send(&mut self, mut msg: Message, workers: &WorkerManager) {
        let from = *msg.from.get_or_insert(Endpoint::Master);

        if let Some(pid) = msg.receiver_pid.as_deref() {
            msg.to = Some(if pid == self.pid {
                Endpoint::Master
            } else if workers.agent().is_some_and(|a| a.worker_id.to_string() == pid) {
                Endpoint::Agent
            } else {
                Endpoint::App
            });
        }
        if msg.to.is_none() {
            msg.to = from.default_route();
        }

        let Some(to) = msg.to else {
            tracing::debug!(action = %msg.action, from = from.as_str(), "[master] message without destination dropped");
            return;
        };
        tracing::trace!(action = %msg.action, from = from.as_str(), to = to.as_str(), "[master] route");
        match to {
            Endpoint::Master => {
                let _ = self.master.send(msg);
            }
            Endpoint::Parent => self.send_to_parent(msg),
            Endpoint::App => send_to_apps(msg, workers),
            Endpoint::Agent => {
                if let Some(agent) = workers.agent() {
                    if let Err(err) = agent.link.send(msg) {
                        tracing::debug!(worker_id = agent.worker_id, error = %err, "[master] agent unreachable");
                    }
                }
            }
        }
    }

    fn send_to_parent(&mut self, msg: Message) {
        let Some(parent) = &self.parent else {
            return;
        };
        if parent.send(msg).is_err() {
            tracing::debug!("[master] parent gone, dropping later parent messages");
            self.parent = None;
        }
    }
}

fn send_to_apps(msg: Message, workers: &WorkerManager) {
    for worker in workers.workers() {
        if matches!(worker.state, AppState::Disconnected | AppState::Dead) {
            continue;
        }
        if let Some(pid) = msg.receiver_pid.as_deref() {
            if pid != worker.worker_id.to_string() {
                continue;
            }
        }
        if let Err(err) = worker.link.send(msg.clone()) {
            tracing::debug!(worker_id = worker.worker_id, error = %err, "[master] app worker unreachable");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::WorkerId;
    use crate::ipc::Frame;
    use crate::manager::{AgentHandle, AgentStatus, AppHandle};

    struct Fixture {
        messenger: Messenger,
        workers: WorkerManager,
        master: UnboundedReceiver<Message>,
        parent: UnboundedReceiver<Message>,
        agent: UnboundedReceiver<Frame>,
        apps: Vec<UnboundedReceiver<Frame>>,
    }

    fn fixture(states: &[AppState]) -> Fixture {
        let (master_tx, master) = mpsc::unbounded_channel();
        let (parent_tx, parent) = mpsc::unbounded_channel();
        let mut workers = WorkerManager::new();

        let (link, agent) = Link::channel();
        workers.set_agent(AgentHandle {
            id: 1,
            worker_id: 100,
            status: AgentStatus::Started,
            link,
        });
        let mut apps = Vec::new();
        for (i, state) in states.iter().enumerate() {
            let (link, rx) = Link::channel();
            let worker_id = 200 + i as WorkerId;
            workers.set_worker(AppHandle {
                id: i as u64 + 1,
                worker_id,
                state: *state,
                disable_refork: false,
                is_dev_reload: false,
                port: None,
                link,
            });
            apps.push(rx);
        }

        Fixture {
            messenger: Messenger::new(1, master_tx, Some(ParentLink::Channel(parent_tx))),
            workers,
            master,
            parent,
            agent,
            apps,
        }
    }

    #[test]
    fn test_agent_message_defaults_to_every_connected_app() {
        let mut f = fixture(&[AppState::Listening, AppState::Disconnected, AppState::Starting]);
        f.messenger
            .send(Message::new("hello").with_from(Endpoint::Agent), &f.workers);

        assert_eq!(f.apps[0].try_recv().unwrap().message.action, "hello");
        assert!(f.apps[1].try_recv().is_err());
        assert_eq!(f.apps[2].try_recv().unwrap().message.to, Some(Endpoint::App));
    }

    #[test]
    fn test_app_message_defaults_to_agent() {
        let mut f = fixture(&[AppState::Listening]);
        f.messenger
            .send(Message::new("hello").with_from(Endpoint::App), &f.workers);
        assert_eq!(f.agent.try_recv().unwrap().message.action, "hello");
    }

    #[test]
    fn test_receiver_pid_selects_target() {
        let mut f = fixture(&[AppState::Listening, AppState::Listening]);

        f.messenger.send(
            Message::new("direct").with_from(Endpoint::Agent).with_receiver_pid(201),
            &f.workers,
        );
        assert!(f.apps[0].try_recv().is_err());
        assert_eq!(f.apps[1].try_recv().unwrap().message.action, "direct");

        f.messenger.send(
            Message::new("to-agent").with_to(Endpoint::App).with_receiver_pid(100),
            &f.workers,
        );
        assert_eq!(f.agent.try_recv().unwrap().message.action, "to-agent");

        f.messenger
            .send(Message::new("to-master").with_receiver_pid(1), &f.workers);
        assert_eq!(f.master.try_recv().unwrap().action, "to-master");
    }

    #[test]
    fn test_parent_message_defaults_to_master() {
        let mut f = fixture(&[]);
        f.messenger
            .send(Message::new("reload").with_from(Endpoint::Parent), &f.workers);
        assert_eq!(f.master.try_recv().unwrap().from, Some(Endpoint::Parent));
    }

    #[test]
    fn test_master_message_without_destination_is_dropped() {
        let mut f = fixture(&[AppState::Listening]);
        f.messenger.send(Message::new("nowhere"), &f.workers);
        assert!(f.master.try_recv().is_err());
        assert!(f.agent.try_recv().is_err());
        assert!(f.apps[0].try_recv().is_err());
    }

    #[test]
    fn test_parent_is_forgotten_once_gone() {
        let mut f = fixture(&[]);
        f.messenger
            .send(Message::new("egg-ready").with_to(Endpoint::Parent), &f.workers);
        assert_eq!(f.parent.try_recv().unwrap().action, "egg-ready");

        drop(f.parent);
        f.messenger
            .send(Message::new("egg-ready").with_to(Endpoint::Parent), &f.workers);
        assert!(!f.messenger.has_parent());
    }
}
