//! Error types used by the cluster master, its supervisors and the worker runtime.
//!
//! - [`ClusterError`] errors raised by the master and the supervisors (fatal boot failures,
//!   worker deaths, spawn failures, sticky listener failures).
//! - [`ConfigError`] option validation failures.
//! - [`IpcError`] failures of the master/worker message channel.
//! - [`WorkerError`] failures reported by the worker runtime and the hosted application.
//!
//! Every enum provides `as_label()` (stable snake_case label for logs/metrics).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::manager::{AgentStatus, AppState};
use crate::mode::Role;
use crate::WorkerId;

/// # Errors produced by the cluster master.
///
/// Fatal decisions are centralized in the master: it logs one of these and stops
/// with exit code `1`. Worker deaths in steady state are logged with the same
/// types but are not fatal.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Options failed validation.
    #[error("invalid cluster options: {0}")]
    Config(#[from] ConfigError),

    /// No free port could be reserved for the internal cluster/sticky ports.
    #[error("[master] detect free port failed: {source}")]
    PortDetection {
        #[source]
        source: io::Error,
    },

    /// The launch mode could not start a worker.
    #[error("[master] fork {role} worker failed: {source}")]
    Spawn {
        role: Role,
        #[source]
        source: io::Error,
    },

    /// The agent worker exited.
    #[error(
        "[master] agent_worker#{id}:{worker_id} died (code: {}, signal: {})",
        fmt_opt(.code),
        fmt_opt(.signal)
    )]
    AgentDied {
        id: u64,
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<String>,
        status: AgentStatus,
    },

    /// An app worker exited.
    #[error(
        "[master] app_worker#{id}:{worker_id} died (code: {}, signal: {}, state: {state}), current workers: {current:?}",
        fmt_opt(.code),
        fmt_opt(.signal)
    )]
    AppDied {
        id: u64,
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<String>,
        state: AppState,
        current: Vec<WorkerId>,
    },

    /// The agent reported an error (process-level channel error).
    #[error("[master] agent_worker#{id}:{worker_id} got error: {reason}")]
    AgentWorker {
        id: u64,
        worker_id: WorkerId,
        reason: String,
    },

    /// A worker died before the cluster reached full readiness.
    #[error("[master] {role}_worker#{id}:{worker_id} start fail, exiting with code:1")]
    StartFailed { role: Role, id: u64, worker_id: WorkerId },

    /// The health check saw neither an agent nor an app worker alive for too long.
    #[error("[master] {agent} agent and {worker} worker(s) alive, exit to avoid unknown state")]
    WorkerException { agent: usize, worker: usize },

    /// The master-side sticky listener could not be opened.
    #[error("[master] sticky server listen on port {} failed: {source}", fmt_opt(.port))]
    StickyListen {
        port: Option<u16>,
        #[source]
        source: io::Error,
    },

    /// The pid file could not be written.
    #[error("[master] write pid file {} failed: {source}", .path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Channel level failure.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// The cluster stopped before it became ready.
    #[error("[master] cluster not ready: {reason}")]
    NotReady { reason: Arc<str> },

    /// The master already stopped.
    #[error("[master] closed")]
    Closed,
}

impl ClusterError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use procvisor::ClusterError;
    ///
    /// let err = ClusterError::WorkerException { agent: 0, worker: 0 };
    /// assert_eq!(err.as_label(), "cluster_worker_exception");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ClusterError::Config(_) => "cluster_config",
            ClusterError::PortDetection { .. } => "cluster_port_detection",
            ClusterError::Spawn { .. } => "cluster_spawn",
            ClusterError::AgentDied { .. } => "agent_worker_died",
            ClusterError::AppDied { .. } => "app_worker_died",
            ClusterError::AgentWorker { .. } => "agent_worker_error",
            ClusterError::StartFailed { .. } => "cluster_start_failed",
            ClusterError::WorkerException { .. } => "cluster_worker_exception",
            ClusterError::StickyListen { .. } => "cluster_sticky_listen",
            ClusterError::PidFile { .. } => "cluster_pid_file",
            ClusterError::Ipc(_) => "cluster_ipc",
            ClusterError::NotReady { .. } => "cluster_not_ready",
            ClusterError::Closed => "cluster_closed",
        }
    }
}

/// # Option validation errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `workers` resolved to zero.
    #[error("workers should be at least 1")]
    NoWorkers,

    /// worker_threads mode was requested without any port.
    #[error("worker_threads mode requires at least one port")]
    MissingPorts,

    /// An environment variable held a malformed duration.
    #[error("invalid {name}={value:?}, expected milliseconds")]
    InvalidDuration { name: &'static str, value: String },

    /// An environment variable held a malformed port.
    #[error("invalid {name}={value:?}, expected a port number")]
    InvalidPort { name: &'static str, value: String },

    /// The launcher runs a different start mode than the options ask for.
    #[error("launcher runs {launcher} workers but options ask for {options}")]
    ModeMismatch {
        launcher: &'static str,
        options: &'static str,
    },

    /// worker_threads mode needs explicit worker entries.
    #[error("worker_threads mode needs a ThreadLauncher with agent and app entries")]
    MissingThreadEntries,

    /// The options blob handed to a worker could not be decoded.
    #[error("malformed options blob: {0}")]
    Options(#[from] serde_json::Error),
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::NoWorkers => "config_no_workers",
            ConfigError::MissingPorts => "config_missing_ports",
            ConfigError::InvalidDuration { .. } => "config_invalid_duration",
            ConfigError::InvalidPort { .. } => "config_invalid_port",
            ConfigError::ModeMismatch { .. } => "config_mode_mismatch",
            ConfigError::MissingThreadEntries => "config_missing_thread_entries",
            ConfigError::Options(_) => "config_options",
        }
    }
}

/// # Message channel errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IpcError {
    /// Socket level failure.
    #[error("ipc io: {0}")]
    Io(#[from] io::Error),

    /// A packet did not hold a valid message.
    #[error("ipc decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// Encoded message does not fit in one packet.
    #[error("ipc message of {size} bytes exceeds the {limit} bytes packet limit")]
    TooLarge { size: usize, limit: usize },

    /// The peer closed the channel.
    #[error("ipc channel closed")]
    Closed,

    /// The worker was not started with an inherited channel.
    #[error("ipc channel not inherited: {0} is not set")]
    MissingChannel(&'static str),
}

impl IpcError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            IpcError::Io(_) => "ipc_io",
            IpcError::Decode(_) => "ipc_decode",
            IpcError::TooLarge { .. } => "ipc_too_large",
            IpcError::Closed => "ipc_closed",
            IpcError::MissingChannel(_) => "ipc_missing_channel",
        }
    }
}

/// # Errors raised inside a worker.
///
/// Returned by [`AgentApp`](crate::AgentApp) / [`Application`](crate::Application)
/// hooks and by the worker runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The hosted application failed to start.
    #[error("start failed: {0}")]
    Start(String),

    /// The hosted application did not become ready in time.
    #[error("start timeout")]
    StartTimeout,

    /// The hosted application failed to close.
    #[error("close failed: {0}")]
    Close(String),

    /// Listening socket or accept failure.
    #[error("server error: {0}")]
    Server(#[from] io::Error),

    /// Channel to the master failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Options blob missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Start(_) => "worker_start",
            WorkerError::StartTimeout => "worker_start_timeout",
            WorkerError::Close(_) => "worker_close",
            WorkerError::Server(_) => "worker_server",
            WorkerError::Ipc(_) => "worker_ipc",
            WorkerError::Config(_) => "worker_config",
        }
    }
}

fn fmt_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_exception_message() {
        let err = ClusterError::WorkerException { agent: 0, worker: 0 };
        assert_eq!(
            err.to_string(),
            "[master] 0 agent and 0 worker(s) alive, exit to avoid unknown state"
        );
    }

    #[test]
    fn test_app_died_message_renders_missing_fields_as_null() {
        let err = ClusterError::AppDied {
            id: 2,
            worker_id: 4242,
            code: None,
            signal: Some("SIGKILL".into()),
            state: AppState::Listening,
            current: vec![4242, 4243],
        };
        assert_eq!(
            err.to_string(),
            "[master] app_worker#2:4242 died (code: null, signal: SIGKILL, state: listening), current workers: [4242, 4243]"
        );
        assert_eq!(err.as_label(), "app_worker_died");
    }

    #[test]
    fn test_start_failed_names_the_role() {
        let err = ClusterError::StartFailed {
            role: Role::Agent,
            id: 1,
            worker_id: 10,
        };
        assert_eq!(
            err.to_string(),
            "[master] agent_worker#1:10 start fail, exiting with code:1"
        );
    }
}
