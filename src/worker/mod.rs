//! # Worker side runtime.
//!
//! Entry points for the two worker tiers. They host an external service behind a
//! trait and speak the master's lifecycle protocol on its behalf:
//!
//! - [`run_agent`] hosts an [`AgentApp`] and reports `agent-start`.
//! - [`run_app`] hosts an [`Application`], binds its listener and reports
//!   `realport` / `listening`.
//!
//! Both take a [`WorkerContext`]. Process workers build theirs with
//! [`WorkerContext::from_process`]; worker_threads workers receive one from the
//! [`ThreadLauncher`](crate::ThreadLauncher).
//!
//! Exit codes: `0` graceful, `1` start failure or start timeout
//! ([`ClusterOptions::start_timeout`](crate::ClusterOptions::start_timeout)),
//! [`EXIT_DISCONNECTED`] when the master goes away outside the graceful path.

mod agent;
mod app;
mod context;

use std::time::Duration;

use crate::error::WorkerError;

pub use agent::{AgentApp, run_agent};
pub use app::{Application, Connection, STICKY_CONNECTION, run_app};
pub use context::{WorkerContext, WorkerSender, role_from_args};

/// Exit code of a worker whose master went away.
pub const EXIT_DISCONNECTED: i32 = 110;

/// Runs a hosted service's `start`, failing with [`WorkerError::StartTimeout`]
/// once `limit` elapses.
async fn start_within<F>(limit: Option<Duration>, start: F) -> Result<(), WorkerError>
where
    F: Future<Output = Result<(), WorkerError>>,
{
    let Some(limit) = limit else {
        return start.await;
    };
    match tokio::time::timeout(limit, start).await {
        Ok(res) => res,
        Err(_) => Err(WorkerError::StartTimeout),
    }
}
