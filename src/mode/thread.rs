//! # worker_threads launch mode.
//!
//! Every worker is a Tokio task running a [`WorkerFn`] inside the master process.
//! Worker ids are drawn from a per-launcher counter starting at 1.
//!
//! ```text
//! spawn ─► WorkerContext{link, incoming, shutdown} ─► tokio::spawn(entry(ctx))
//!                                                          │
//!           exit mapping:  Ok(code)      ─► code           │
//!                          aborted       ─► SIGKILL  ◄─────┘
//!                          panicked      ─► code 1
//! ```
//!
//! Termination cancels the worker's shutdown token and aborts the task if it has
//! not returned within the timeout.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{Instance, InstanceControl, Launcher, Pump, Role, SpawnRequest, WorkerExit};
use crate::config::StartMode;
use crate::error::ClusterError;
use crate::ipc::Link;
use crate::worker::WorkerContext;

/// Entry point of an in-process worker; resolves to its exit code.
pub type WorkerFn = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, i32> + Send + Sync>;

/// Launches workers as Tokio tasks.
pub struct ThreadLauncher {
    agent: WorkerFn,
    app: WorkerFn,
    next_id: AtomicU32,
}

impl ThreadLauncher {
    pub fn new<A, AF, P, PF>(agent: A, app: P) -> Self
    where
        A: Fn(WorkerContext) -> AF + Send + Sync + 'static,
        AF: Future<Output = i32> + Send + 'static,
        P: Fn(WorkerContext) -> PF + Send + Sync + 'static,
        PF: Future<Output = i32> + Send + 'static,
    {
        Self {
            agent: Arc::new(move |ctx| agent(ctx).boxed()),
            app: Arc::new(move |ctx| app(ctx).boxed()),
            next_id: AtomicU32::new(1),
        }
    }

    fn entry(&self, role: Role) -> &WorkerFn {
        match role {
            Role::Agent => &self.agent,
            Role::App => &self.app,
        }
    }
}

impl Launcher for ThreadLauncher {
    fn mode(&self) -> StartMode {
        StartMode::WorkerThreads
    }

    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Instance, ClusterError> {
        let role = request.role;
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (link, worker_incoming) = Link::channel();
        let (worker_link, incoming) = Link::channel();
        let shutdown = CancellationToken::new();
        let ctx = WorkerContext::new(
            role,
            worker_id,
            request.options.clone(),
            worker_link,
            worker_incoming,
            shutdown.clone(),
        );

        let task = tokio::spawn((self.entry(role))(ctx));
        let abort = task.abort_handle();
        let exit = async move {
            match task.await {
                Ok(code) => Ok::<_, io::Error>(WorkerExit::code(code)),
                Err(err) if err.is_cancelled() => Ok(WorkerExit::signal("SIGKILL")),
                Err(err) => {
                    tracing::error!(role = %role, worker_id, error = %err, "[master] worker thread panicked");
                    Ok(WorkerExit::code(1))
                }
            }
        };

        let (exited_tx, exited) = watch::channel(false);
        let detached = CancellationToken::new();
        let pump = Pump {
            role,
            worker_id,
            incoming,
            relay: request.relay.clone(),
            detached: detached.clone(),
            exited: exited_tx,
        };
        tokio::spawn(pump.run(exit));

        Ok(Instance {
            worker_id,
            link,
            control: Box::new(ThreadControl {
                shutdown,
                abort,
                exited,
                detached,
            }),
        })
    }
}

struct ThreadControl {
    shutdown: CancellationToken,
    abort: AbortHandle,
    exited: watch::Receiver<bool>,
    detached: CancellationToken,
}

#[async_trait]
impl InstanceControl for ThreadControl {
    fn detach(&self) {
        self.detached.cancel();
    }

    async fn terminate(&self, timeout: Duration) {
        self.shutdown.cancel();
        let mut exited = self.exited.clone();
        if tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "[master] worker thread did not stop in time, aborting");
            self.abort.abort();
            let _ = exited.wait_for(|done| *done).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ClusterOptions;
    use crate::message::Message;

    fn spawn(launcher: &ThreadLauncher, role: Role, relay: &mpsc::UnboundedSender<Message>) -> Instance {
        let options = ClusterOptions::default();
        launcher
            .spawn(SpawnRequest {
                role,
                id: 1,
                options: &options,
                relay,
            })
            .unwrap()
    }

    async fn exit_of(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.action.ends_with("-exit") {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_thread_ids_are_sequential() {
        let launcher = ThreadLauncher::new(|_| async { 0 }, |_| async { 0 });
        let (relay, _rx) = mpsc::unbounded_channel();

        let a = spawn(&launcher, Role::Agent, &relay);
        let b = spawn(&launcher, Role::App, &relay);
        assert_eq!((a.worker_id, b.worker_id), (1, 2));
    }

    #[tokio::test]
    async fn test_return_value_is_the_exit_code() {
        let launcher = ThreadLauncher::new(|_| async { 5 }, |_| async { 0 });
        let (relay, mut rx) = mpsc::unbounded_channel();

        let instance = spawn(&launcher, Role::Agent, &relay);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.action, "agent-exit");
        assert_eq!(
            msg.data,
            Some(json!({ "workerId": instance.worker_id, "code": 5, "signal": null }))
        );
    }

    #[tokio::test]
    async fn test_worker_messages_reach_the_relay() {
        let launcher = ThreadLauncher::new(
            |ctx: WorkerContext| async move {
                let _ = ctx.sender().send(Message::new("agent-start"));
                ctx.shutdown_token().cancelled().await;
                0
            },
            |_| async { 0 },
        );
        let (relay, mut rx) = mpsc::unbounded_channel();

        let _instance = spawn(&launcher, Role::Agent, &relay);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.action, "agent-start");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_worker_stops_on_shutdown() {
        let launcher = ThreadLauncher::new(
            |_| async { 0 },
            |ctx: WorkerContext| async move {
                ctx.shutdown_token().cancelled().await;
                0
            },
        );
        let (relay, mut rx) = mpsc::unbounded_channel();

        let instance = spawn(&launcher, Role::App, &relay);
        instance.control.terminate(Duration::from_secs(5)).await;

        let msg = exit_of(&mut rx).await;
        assert_eq!(msg.action, "app-exit");
        assert_eq!(msg.data.unwrap()["code"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_is_aborted() {
        let launcher = ThreadLauncher::new(
            |_| async { 0 },
            |_| async {
                futures::future::pending::<()>().await;
                0
            },
        );
        let (relay, mut rx) = mpsc::unbounded_channel();

        let instance = spawn(&launcher, Role::App, &relay);
        instance.control.terminate(Duration::from_millis(500)).await;

        let msg = exit_of(&mut rx).await;
        assert_eq!(msg.action, "app-exit");
        assert_eq!(msg.data.unwrap()["signal"], json!("SIGKILL"));
    }
}
