//! # procvisor
//!
//! **Procvisor** supervises a multi-process server on one host: one master, one
//! agent worker for background duties and N app workers serving requests.
//!
//! It boots the tiers in order, relays messages between them, replaces workers
//! that die, and shuts everything down in a fixed order. The hosted service
//! lives behind the [`AgentApp`] and [`Application`] traits.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                        ┌──────────────────────┐
//!                        │  parent (optional)   │
//!                        └──────────┬───────────┘
//!                                   ▼ egg-ready / *-worker-died
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Master (single-owner loop)                                       │
//! │  - Messenger (routes by `to` / `from` / `receiverPid`)            │
//! │  - WorkerManager (agent slot + app handles)                       │
//! │  - AgentSupervisor / AppSupervisor (fork, refork, kill)           │
//! │  - HealthCheck, sticky listener                                   │
//! └──────┬──────────────────┬──────────────────┬───────────────┬──────┘
//!        ▼                  ▼                  ▼               │
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//!     │ agent worker │   │ app worker 1 │   │ app worker N │   │
//!     │  run_agent   │   │   run_app    │   │   run_app    │   │
//!     └──────────────┘   └──────────────┘   └──────────────┘   │
//!       Link + pump        Link + pump        Link + pump      │
//!                                                              ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │               (capacity: MasterConfig::bus_capacity)              │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                             SubscriberSet
//!                        ┌──────────┼──────────┐
//!                        ▼          ▼          ▼
//!                    LogWriter    sub 2      sub N
//! ```
//!
//! ### Lifecycle
//! ```text
//! build() ─► run()
//!   ├─► pid file, detect cluster port (+ sticky worker port)
//!   ├─► fork agent ─► agent-start ─► fork N app workers
//!   ├─► app-start × N on the expected port ─► [sticky listen] ─► egg-ready
//!   │
//!   ├─ steady state:
//!   │    agent dies    ─► refork after backoff, parent gets agent-worker-died
//!   │    app dies      ─► refork (policy + rate limit), parent gets app-worker-died
//!   │    health check  ─► 3 misses in a row ─► exit 1
//!   │
//!   └─ SIGINT / SIGQUIT / SIGTERM / MasterHandle::close:
//!        kill apps (app timeout) ─► kill agent (agent timeout) ─► exit 0
//! ```
//! Any worker death before `egg-ready` ends the master with exit code 1.
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                         |
//! |-------------------|---------------------------------------------------------------|--------------------------------------------|
//! | **Master**        | Boot, supervision, routing and shutdown.                      | [`Master`], [`MasterBuilder`], [`MasterHandle`] |
//! | **Launch modes**  | Worker processes or in-process worker tasks.                  | [`ProcessLauncher`], [`ThreadLauncher`]    |
//! | **Workers**       | Host the agent and the app, speak the lifecycle protocol.     | [`run_agent`], [`run_app`], [`WorkerContext`] |
//! | **Subscriber API**| Observe lifecycle events.                                     | [`Subscribe`], [`LogWriter`]               |
//! | **Policies**      | Agent refork backoff, app refork rate limit.                  | [`BackoffPolicy`], [`ReforkPolicy`]        |
//! | **Errors**        | Typed errors with stable labels.                              | [`ClusterError`], [`WorkerError`]          |
//! | **Configuration** | Options blob plus environment-driven master settings.         | [`ClusterOptions`], [`MasterConfig`]       |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use procvisor::{ClusterOptions, LogWriter, Master, role_from_args};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     if role_from_args().is_some() {
//!         // agent-worker / app-worker entry, see demos/cluster.rs
//!         return Ok(());
//!     }
//!
//!     let options = ClusterOptions { workers: 2, port: Some(7001), ..Default::default() };
//!     let (master, handle) = Master::builder(options)
//!         .with_subscribers(vec![Arc::new(LogWriter)])
//!         .build()?;
//!
//!     tokio::spawn(async move {
//!         if let Ok(info) = handle.ready().await {
//!             println!("listening on {}", info.address);
//!         }
//!     });
//!     std::process::exit(master.run().await);
//! }
//! ```

mod config;
mod core;
mod error;
mod events;
mod ipc;
mod manager;
mod message;
mod messenger;
mod mode;
mod policies;
mod signals;
mod subscribers;
mod terminate;
mod worker;

/// Worker identifier: the OS pid in process mode, a launcher counter in
/// worker_threads mode.
pub type WorkerId = u32;

// ---- Public re-exports ----

pub use config::{ClusterOptions, ListenOptions, MasterConfig, StartMode};
pub use self::core::{
    ListeningAddress, Master, MasterBuilder, MasterHandle, Phase, ReadyInfo, Readiness, ready_address,
    worker_index,
};
pub use error::{ClusterError, ConfigError, IpcError, WorkerError};
pub use events::{Bus, Event, EventKind};
pub use ipc::{Frame, IPC_FD_ENV, Link};
pub use manager::{AgentStatus, AppState, WorkerCount};
pub use message::{Endpoint, Message};
pub use mode::{
    AGENT_WORKER_ARG, APP_WORKER_ARG, Instance, InstanceControl, Launcher, ProcessLauncher, Role,
    SpawnRequest, ThreadLauncher, WorkerCommand, WorkerExit, WorkerFn,
};
pub use policies::{BackoffPolicy, JitterPolicy, ReforkPolicy};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use terminate::{ProcessSignals, SystemSignals};
pub use worker::{
    AgentApp, Application, Connection, EXIT_DISCONNECTED, STICKY_CONNECTION, WorkerContext, WorkerSender,
    role_from_args, run_agent, run_app,
};
