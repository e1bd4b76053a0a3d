//! Agent worker entry.
//!
//! ```text
//! start() ──ok──► send agent-start ──► loop { master frames ─► on_message }
//!    │                                      │                    │
//!    └─err / timeout─► exit 1   shutdown ─► close() ─► exit 0    └─ master gone ─► exit 110
//! ```

use async_trait::async_trait;

use super::{EXIT_DISCONNECTED, WorkerContext, WorkerSender, start_within};
use crate::error::WorkerError;
use crate::message::{Endpoint, Message};

/// The hosted background service of the agent worker.
#[async_trait]
pub trait AgentApp: Send + 'static {
    /// Boots the service; the agent reports started once this returns `Ok`.
    async fn start(&mut self, sender: WorkerSender) -> Result<(), WorkerError>;

    /// A message routed to the agent.
    async fn on_message(&mut self, _msg: Message) {}

    /// Graceful shutdown hook.
    async fn close(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Runs `agent` until shutdown; returns the worker's exit code.
pub async fn run_agent<A: AgentApp>(mut ctx: WorkerContext, mut agent: A) -> i32 {
    let sender = ctx.sender();
    let shutdown = ctx.shutdown_token();
    let limit = ctx.options().start_timeout();

    let started = tokio::select! {
        res = start_within(limit, agent.start(sender.clone())) => Some(res),
        _ = shutdown.cancelled() => None,
    };
    match started {
        None => return graceful_exit(&mut agent).await,
        Some(Err(WorkerError::StartTimeout)) => {
            tracing::error!(label = "worker_start_timeout", "[agent_worker] start timeout, exiting with code:1");
            return 1;
        }
        Some(Err(err)) => {
            tracing::error!(error = %err, label = err.as_label(), "[agent_worker] start error, exiting with code:1");
            return 1;
        }
        Some(Ok(())) => {}
    }

    if sender
        .send(Message::new("agent-start").with_to(Endpoint::Master))
        .is_err()
    {
        return disconnected(&mut agent).await;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            frame = ctx.recv() => Some(frame),
        };
        match next {
            None => return graceful_exit(&mut agent).await,
            Some(Some(frame)) => agent.on_message(frame.message).await,
            Some(None) => return disconnected(&mut agent).await,
        }
    }
}

async fn graceful_exit<A: AgentApp>(agent: &mut A) -> i32 {
    if let Err(err) = agent.close().await {
        tracing::error!(error = %err, "[agent_worker] close error");
    }
    tracing::info!("[agent_worker] exit with code:0");
    0
}

async fn disconnected<A: AgentApp>(agent: &mut A) -> i32 {
    tracing::error!("[agent_worker] master disconnected, exiting with code:{}", EXIT_DISCONNECTED);
    let _ = agent.close().await;
    EXIT_DISCONNECTED
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::ClusterOptions;
    use crate::ipc::Link;
    use crate::mode::Role;

    struct Recorder {
        fail: bool,
        hang: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AgentApp for Recorder {
        async fn start(&mut self, _sender: WorkerSender) -> Result<(), WorkerError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(WorkerError::Start("boom".into()));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), WorkerError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_error_exits_with_one() {
        let (link, _out) = Link::channel();
        let (_master, incoming) = Link::channel();
        let ctx = WorkerContext::new(Role::Agent, 1, ClusterOptions::default(), link, incoming, CancellationToken::new());

        let code = run_agent(ctx, Recorder { fail: true, hang: false, closed: Arc::default() }).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_reports_start_then_exits_gracefully() {
        let (link, mut out) = Link::channel();
        let (_master, incoming) = Link::channel();
        let shutdown = CancellationToken::new();
        let ctx = WorkerContext::new(Role::Agent, 1, ClusterOptions::default(), link, incoming, shutdown.clone());
        let closed = Arc::new(AtomicBool::new(false));

        let run = tokio::spawn(run_agent(ctx, Recorder { fail: false, hang: false, closed: closed.clone() }));
        let frame = out.recv().await.unwrap();
        assert_eq!(frame.message.action, "agent-start");
        assert_eq!(frame.message.to, Some(Endpoint::Master));

        shutdown.cancel();
        assert_eq!(run.await.unwrap(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_master_loss_exits_with_110() {
        let (link, _out) = Link::channel();
        let (master, incoming) = Link::channel();
        let ctx = WorkerContext::new(Role::Agent, 1, ClusterOptions::default(), link, incoming, CancellationToken::new());
        drop(master);

        let code = run_agent(ctx, Recorder { fail: false, hang: false, closed: Arc::default() }).await;
        assert_eq!(code, EXIT_DISCONNECTED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_exits_with_one() {
        let (link, mut out) = Link::channel();
        let (_master, incoming) = Link::channel();
        let options = ClusterOptions {
            worker_start_timeout: Some(2000),
            ..Default::default()
        };
        let ctx = WorkerContext::new(Role::Agent, 1, options, link, incoming, CancellationToken::new());

        let began = tokio::time::Instant::now();
        let code = run_agent(ctx, Recorder { fail: false, hang: true, closed: Arc::default() }).await;
        assert_eq!(code, 1);
        assert!(began.elapsed() >= std::time::Duration::from_millis(2000));
        assert!(out.try_recv().is_err());
    }
}
