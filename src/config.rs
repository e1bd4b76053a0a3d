//! # Cluster configuration.
//!
//! Two layers:
//! - [`ClusterOptions`] the options blob. Serialized as camelCase JSON and handed to
//!   every worker as its last positional argument; immutable once parsed.
//! - [`MasterConfig`] runtime knobs of the master itself (close timeouts, health check,
//!   refork policies, bus capacity). Read once from the environment.
//!
//! ## Sentinel values
//! - `workers = 0` → one worker per available CPU
//! - `health_interval = 0s` → no health check
//! - `app_refork.enabled = None` → refork only in production
//!
//! ## Environment
//! | Variable                   | Used for                                   | Default |
//! |----------------------------|--------------------------------------------|---------|
//! | `EGG_SERVER_ENV`           | `ClusterOptions::env` when not set         | -       |
//! | `NODE_ENV`                 | production detection when `env` is unset   | -       |
//! | `EGG_APP_CLOSE_TIMEOUT`    | app kill timeout (ms)                      | master  |
//! | `EGG_AGENT_CLOSE_TIMEOUT`  | agent kill timeout (ms)                    | master  |
//! | `EGG_MASTER_CLOSE_TIMEOUT` | fallback for both timeouts (ms)            | 5000    |
//! | `EGG_AGENT_DEBUG_PORT`     | agent inspector port in debug mode         | 5800    |
//! | `HOST`                     | hostname of the reported ready address     | -       |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, ReforkPolicy};

/// Default port when https is configured without an explicit port.
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
/// Default kill timeout for both worker tiers.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default inspector port of the agent in debug mode.
pub const DEFAULT_AGENT_DEBUG_PORT: u16 = 5800;
/// Default time a worker's hosted service gets to start.
pub const DEFAULT_WORKER_START_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How workers are launched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// One OS process per worker.
    #[default]
    Process,
    /// One in-process task per worker; each app worker owns one port from `ports`.
    WorkerThreads,
}

impl StartMode {
    /// Stable name used in logs and options.
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Process => "process",
            StartMode::WorkerThreads => "worker_threads",
        }
    }
}

/// Listen settings of the hosted application.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenOptions {
    /// Port used when the options carry none.
    pub port: Option<u16>,
    /// Unix socket path; wins over any port.
    pub path: Option<PathBuf>,
    /// Interface to bind; all interfaces when unset.
    pub hostname: Option<String>,
}

/// Options blob shared by the master and every worker.
///
/// Framework parameters the supervisor does not interpret travel in `extra`
/// (flattened into the JSON object).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterOptions {
    /// Name of the hosted framework (logs only).
    pub framework: Option<String>,
    /// Application base directory.
    pub base_dir: Option<PathBuf>,
    /// Number of app workers (`0` = available parallelism).
    pub workers: usize,
    /// Public port.
    pub port: Option<u16>,
    /// One port per app worker in worker_threads mode.
    pub ports: Vec<u16>,
    /// Opaque TLS settings; only their presence is interpreted.
    pub https: Option<Value>,
    /// Modules the framework preloads in every worker.
    pub require: Vec<String>,
    /// Server environment (`local`, `unittest`, `prod`, ...).
    pub env: Option<String>,
    /// Launch mode.
    pub start_mode: StartMode,
    /// Route connections by client ip through the master.
    pub sticky: bool,
    /// Debugger attached to the workers.
    pub is_debug: bool,
    /// Inspector base port in debug mode.
    pub debug_port: Option<u16>,
    /// Pid file written at master start.
    pub pid_file: Option<PathBuf>,
    /// Milliseconds a worker's hosted service gets to start (`0` = no limit).
    pub worker_start_timeout: Option<u64>,
    /// Internal port for agent/app signaling (filled by port detection).
    pub cluster_port: Option<u16>,
    /// Internal bind target of sticky app workers (filled by port detection).
    pub sticky_worker_port: Option<u16>,
    /// Application listen settings.
    pub listen: ListenOptions,
    /// Framework parameters.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterOptions {
    /// Applies defaults and validates.
    ///
    /// - `env` falls back to `EGG_SERVER_ENV`
    /// - https without a port listens on [`DEFAULT_HTTPS_PORT`]
    /// - worker_threads mode runs one app worker per port
    /// - `workers = 0` resolves to the available parallelism
    pub fn parse(mut self) -> Result<Self, ConfigError> {
        if self.env.is_none() {
            self.env = std::env::var("EGG_SERVER_ENV").ok().filter(|v| !v.is_empty());
        }
        if self.https.is_some() && self.port.is_none() {
            self.port = Some(DEFAULT_HTTPS_PORT);
        }
        if self.start_mode == StartMode::WorkerThreads {
            if self.ports.is_empty() {
                match self.port {
                    Some(port) => self.ports = vec![port],
                    None => return Err(ConfigError::MissingPorts),
                }
            }
            self.workers = self.ports.len();
        }
        if self.workers == 0 {
            self.workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(self)
    }

    /// Decodes the options blob a worker received.
    pub fn from_json(blob: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(blob)?)
    }

    /// Encodes the options blob handed to a worker.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Production detection: an explicit `env` other than `local`/`unittest`,
    /// otherwise `NODE_ENV=production`.
    pub fn is_production(&self) -> bool {
        match self.env.as_deref() {
            Some(env) => env != "local" && env != "unittest",
            None => std::env::var("NODE_ENV").is_ok_and(|v| v == "production"),
        }
    }

    /// Local development: lifecycle logs go to debug level.
    pub fn is_local(&self) -> bool {
        self.env.as_deref() == Some("local")
            || std::env::var("NODE_ENV").is_ok_and(|v| v == "development")
    }

    /// Start deadline of a worker's hosted service (`None` = no limit).
    pub fn start_timeout(&self) -> Option<Duration> {
        match self.worker_start_timeout {
            None => Some(DEFAULT_WORKER_START_TIMEOUT),
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }

    /// `https` when TLS settings are present.
    pub fn protocol(&self) -> &'static str {
        if self.https.is_some() { "https" } else { "http" }
    }
}

/// Runtime configuration of the master.
///
/// All fields are public; prefer the helper accessors over sentinel checks.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Time app workers get between SIGTERM and SIGKILL on close.
    pub app_close_timeout: Duration,
    /// Time the agent gets between SIGTERM and SIGKILL on close.
    pub agent_close_timeout: Duration,
    /// Inspector port announced for the agent in debug mode.
    pub agent_debug_port: u16,
    /// Hostname used in the ready address when the app binds every interface.
    pub host: Option<String>,
    /// Health check period (`0s` = disabled).
    pub health_interval: Duration,
    /// Consecutive failed health checks before the cluster is declared dead.
    pub health_threshold: u32,
    /// Delay before a crashed agent is forked again.
    pub agent_backoff: BackoffPolicy,
    /// Replacement of crashed app workers.
    pub app_refork: ReforkPolicy,
    /// Event bus ring buffer size (min 1).
    pub bus_capacity: usize,
}

impl Default for MasterConfig {
    /// Default configuration:
    ///
    /// - close timeouts `5s`
    /// - agent debug port `5800`
    /// - health check every `10s`, fatal after `3` misses
    /// - agent refork after a constant `1s`
    /// - app refork in production, at most 60 per minute
    fn default() -> Self {
        Self {
            app_close_timeout: DEFAULT_CLOSE_TIMEOUT,
            agent_close_timeout: DEFAULT_CLOSE_TIMEOUT,
            agent_debug_port: DEFAULT_AGENT_DEBUG_PORT,
            host: None,
            health_interval: Duration::from_secs(10),
            health_threshold: 3,
            agent_backoff: BackoffPolicy::constant(Duration::from_secs(1)),
            app_refork: ReforkPolicy::default(),
            bus_capacity: 1024,
        }
    }
}

impl MasterConfig {
    /// Reads the environment of the current process.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let master = millis(&var, "EGG_MASTER_CLOSE_TIMEOUT")?.unwrap_or(DEFAULT_CLOSE_TIMEOUT);

        let mut cfg = Self {
            app_close_timeout: millis(&var, "EGG_APP_CLOSE_TIMEOUT")?.unwrap_or(master),
            agent_close_timeout: millis(&var, "EGG_AGENT_CLOSE_TIMEOUT")?.unwrap_or(master),
            host: var("HOST"),
            ..Self::default()
        };
        if let Some(raw) = var("EGG_AGENT_DEBUG_PORT") {
            cfg.agent_debug_port = raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
                name: "EGG_AGENT_DEBUG_PORT",
                value: raw,
            })?;
        }
        Ok(cfg)
    }

    /// Health check period as an `Option` (`None` = disabled).
    #[inline]
    pub fn health_check_interval(&self) -> Option<Duration> {
        if self.health_interval == Duration::ZERO {
            None
        } else {
            Some(self.health_interval)
        }
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

fn millis<F>(var: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidDuration { name, value: raw }),
    }
}
