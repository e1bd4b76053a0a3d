//! # Process launch mode.
//!
//! Every worker is a child process started from a [`WorkerCommand`]:
//!
//! ```text
//! <program> <args...> <options json>          env PROCVISOR_IPC_FD=3
//!                 │
//!                 └─ fd 3: worker end of a SEQPACKET socketpair
//! ```
//!
//! The child reads its options from the last argument and its channel from fd 3
//! (see [`WorkerContext::from_process`](crate::WorkerContext::from_process)).
//! [`ProcessLauncher::current_exe`] re-executes the running binary with
//! [`AGENT_WORKER_ARG`] / [`APP_WORKER_ARG`] so one binary can host all tiers.

use std::ffi::OsString;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Instance, InstanceControl, Launcher, Pump, Role, SpawnRequest, WorkerExit};
use crate::config::StartMode;
use crate::error::ClusterError;
use crate::ipc::{self, CHILD_IPC_FD, IPC_FD_ENV, IpcChannel};
use crate::terminate::{self, ProcessSignals, SystemSignals};

/// First argument selecting the agent entry of a self-hosting binary.
pub const AGENT_WORKER_ARG: &str = "agent-worker";
/// First argument selecting the app entry of a self-hosting binary.
pub const APP_WORKER_ARG: &str = "app-worker";

/// Program and fixed arguments of one worker tier.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Launches workers as child processes.
pub struct ProcessLauncher {
    agent: WorkerCommand,
    app: WorkerCommand,
    signals: Arc<dyn ProcessSignals>,
}

impl ProcessLauncher {
    pub fn new(agent: WorkerCommand, app: WorkerCommand) -> Self {
        Self {
            agent,
            app,
            signals: Arc::new(SystemSignals),
        }
    }

    /// Workers re-execute the running binary.
    pub fn current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(
            WorkerCommand::new(&exe).arg(AGENT_WORKER_ARG),
            WorkerCommand::new(&exe).arg(APP_WORKER_ARG),
        ))
    }

    /// Replaces the signal backend used on termination.
    pub fn with_signals(mut self, signals: Arc<dyn ProcessSignals>) -> Self {
        self.signals = signals;
        self
    }

    fn command(&self, role: Role) -> &WorkerCommand {
        match role {
            Role::Agent => &self.agent,
            Role::App => &self.app,
        }
    }
}

impl Launcher for ProcessLauncher {
    fn mode(&self) -> StartMode {
        StartMode::Process
    }

    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Instance, ClusterError> {
        let role = request.role;
        let spawn_err = |source: io::Error| ClusterError::Spawn { role, source };

        let blob = request
            .options
            .to_json()
            .map_err(|err| spawn_err(io::Error::other(err)))?;
        let (master_end, worker_end) = ipc::pair().map_err(spawn_err)?;

        let spec = self.command(role);
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .arg(blob)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .env(IPC_FD_ENV, CHILD_IPC_FD.to_string())
            .stdin(Stdio::null());

        let raw = worker_end.as_raw_fd();
        // SAFETY: the hook only calls dup2/fcntl, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || ipc::install_child_fd(raw, CHILD_IPC_FD));
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        drop(worker_end);
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(io::Error::other("worker exited before its pid was read")))?;

        let channel = IpcChannel::new(master_end).map_err(spawn_err)?;
        let (link, incoming) = ipc::attach(channel);
        let (exited_tx, exited) = watch::channel(false);
        let detached = CancellationToken::new();

        let pump = Pump {
            role,
            worker_id: pid,
            incoming,
            relay: request.relay.clone(),
            detached: detached.clone(),
            exited: exited_tx,
        };
        tokio::spawn(pump.run(async move { child.wait().await.map(WorkerExit::from) }));

        Ok(Instance {
            worker_id: pid,
            link,
            control: Box::new(ProcessControl {
                pid,
                exited,
                detached,
                signals: Arc::clone(&self.signals),
            }),
        })
    }
}

struct ProcessControl {
    pid: u32,
    exited: watch::Receiver<bool>,
    detached: CancellationToken,
    signals: Arc<dyn ProcessSignals>,
}

#[async_trait]
impl InstanceControl for ProcessControl {
    fn detach(&self) {
        self.detached.cancel();
    }

    async fn terminate(&self, timeout: Duration) {
        terminate::terminate(self.signals.as_ref(), self.pid, self.exited.clone(), timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ClusterOptions;

    #[tokio::test]
    async fn test_exit_code_of_child_is_relayed() {
        let launcher = ProcessLauncher::new(
            WorkerCommand::new("/bin/sh").arg("-c").arg("exit 3").arg("sh"),
            WorkerCommand::new("/bin/sh").arg("-c").arg("exit 0").arg("sh"),
        );
        let (relay, mut rx) = mpsc::unbounded_channel();
        let options = ClusterOptions::default();

        let instance = launcher
            .spawn(SpawnRequest {
                role: Role::Agent,
                id: 1,
                options: &options,
                relay: &relay,
            })
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.action, "agent-exit");
        assert_eq!(
            msg.data,
            Some(json!({ "workerId": instance.worker_id, "code": 3, "signal": null }))
        );
    }

    #[tokio::test]
    async fn test_terminate_stops_a_sleeping_child() {
        let launcher = ProcessLauncher::new(
            WorkerCommand::new("/bin/sh").arg("-c").arg("sleep 30").arg("sh"),
            WorkerCommand::new("/bin/sh").arg("-c").arg("sleep 30").arg("sh"),
        );
        let (relay, mut rx) = mpsc::unbounded_channel();
        let options = ClusterOptions::default();

        let instance = launcher
            .spawn(SpawnRequest {
                role: Role::App,
                id: 1,
                options: &options,
                relay: &relay,
            })
            .unwrap();
        instance.control.terminate(Duration::from_secs(5)).await;

        loop {
            let msg = rx.recv().await.unwrap();
            if msg.action == "app-exit" {
                assert_eq!(msg.data.unwrap()["signal"], json!("SIGTERM"));
                break;
            }
        }
    }
}
