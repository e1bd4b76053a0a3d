//! Per-worker runtime state handed to worker entry points.

use std::os::fd::RawFd;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::WorkerId;
use crate::config::ClusterOptions;
use crate::error::{IpcError, WorkerError};
use crate::ipc::{self, Frame, IPC_FD_ENV, IpcChannel, Link};
use crate::message::Message;
use crate::mode::{AGENT_WORKER_ARG, APP_WORKER_ARG, Role};
use crate::signals::wait_for_shutdown_signal;

/// Everything a worker needs to talk to its master.
///
/// `shutdown` is cancelled when the master asks the worker to stop: SIGTERM (or
/// SIGINT/SIGQUIT) in process mode, the terminate call in worker_threads mode.
pub struct WorkerContext {
    role: Role,
    worker_id: WorkerId,
    options: ClusterOptions,
    link: Link,
    incoming: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(
        role: Role,
        worker_id: WorkerId,
        options: ClusterOptions,
        link: Link,
        incoming: mpsc::UnboundedReceiver<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            role,
            worker_id,
            options,
            link,
            incoming,
            shutdown,
        }
    }

    /// Context of a worker process started by [`ProcessLauncher`](crate::ProcessLauncher).
    ///
    /// Options come from the last command line argument, the channel from the
    /// descriptor named by `PROCVISOR_IPC_FD`. Must be called inside a Tokio runtime.
    pub fn from_process(role: Role) -> Result<Self, WorkerError> {
        let blob = std::env::args().last().unwrap_or_default();
        let options = ClusterOptions::from_json(&blob)?;

        let fd: RawFd = std::env::var(IPC_FD_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or(IpcError::MissingChannel(IPC_FD_ENV))?;
        // SAFETY: the launcher installed the channel at this descriptor and nothing
        // else in the process owns it.
        let channel = unsafe { IpcChannel::from_raw(fd) }.map_err(IpcError::from)?;
        let (link, incoming) = ipc::attach(channel);

        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(signal) => {
                    tracing::info!(signal, "[{}_worker] receive signal, exiting", role);
                    on_signal.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "[{}_worker] signal handlers not installed", role),
            }
        });

        Ok(Self::new(role, std::process::id(), options, link, incoming, shutdown))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Pid in process mode, thread id in worker_threads mode.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn sender(&self) -> WorkerSender {
        WorkerSender {
            link: self.link.clone(),
            worker_id: self.worker_id,
        }
    }

    /// Next frame from the master; `None` once the master side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Sending half of a worker's link; stamps `senderWorkerId`.
#[derive(Clone, Debug)]
pub struct WorkerSender {
    link: Link,
    worker_id: WorkerId,
}

impl WorkerSender {
    pub fn send(&self, mut msg: Message) -> Result<(), IpcError> {
        msg.sender_worker_id = Some(self.worker_id.to_string());
        self.link.send(msg)
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}

/// Worker tier selected by the first command line argument, if any.
///
/// Lets one binary act as master, agent and app worker (see
/// [`ProcessLauncher::current_exe`](crate::ProcessLauncher::current_exe)).
pub fn role_from_args() -> Option<Role> {
    match std::env::args().nth(1).as_deref() {
        Some(AGENT_WORKER_ARG) => Some(Role::Agent),
        Some(APP_WORKER_ARG) => Some(Role::App),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Endpoint;

    #[tokio::test]
    async fn test_sender_stamps_worker_id() {
        let (link, mut rx) = Link::channel();
        let (_unused, incoming) = Link::channel();
        let ctx = WorkerContext::new(
            Role::App,
            42,
            ClusterOptions::default(),
            link,
            incoming,
            CancellationToken::new(),
        );

        ctx.sender()
            .send(Message::new("ping").with_to(Endpoint::Agent))
            .unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.message.sender_worker_id.as_deref(), Some("42"));
    }
}
