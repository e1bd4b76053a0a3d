//! # Example: cluster
//!
//! One binary playing all three tiers in process mode: started without
//! arguments it is the master; the master re-executes it with `agent-worker` or
//! `app-worker` for the workers.
//!
//! Shows how to:
//! - Implement [`AgentApp`] and [`Application`].
//! - Dispatch on [`role_from_args`] and build a [`WorkerContext`] per worker.
//! - Attach a custom [`Subscribe`] next to [`LogWriter`].
//!
//! ## Flow
//! ```text
//! cluster ──► Master::run()
//!    ├─► fork `cluster agent-worker <options>` ─► Heartbeat::start ─► agent-start
//!    ├─► fork `cluster app-worker <options>` × WORKERS ─► Hello listens on PORT
//!    └─► egg-ready ─► curl http://127.0.0.1:PORT
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=info,procvisor=debug PORT=7001 WORKERS=2 cargo run --example cluster
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use procvisor::{
    AgentApp, Application, ClusterOptions, Connection, Event, EventKind, LogWriter, Master, Message, Role,
    Subscribe, WorkerContext, WorkerError, WorkerSender, role_from_args, run_agent, run_app,
};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

/// Background duty of the agent: log a heartbeat and every routed message.
struct Heartbeat {
    ticker: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl AgentApp for Heartbeat {
    async fn start(&mut self, sender: WorkerSender) -> Result<(), WorkerError> {
        let worker_id = sender.worker_id();
        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticks.tick().await;
                tracing::info!(worker_id, "[agent_worker] heartbeat");
            }
        }));
        Ok(())
    }

    async fn on_message(&mut self, msg: Message) {
        tracing::debug!(action = %msg.action, "[agent_worker] message");
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        Ok(())
    }
}

/// Minimal HTTP responder.
struct Hello {
    worker_id: u32,
}

#[async_trait]
impl Application for Hello {
    async fn start(&self, _sender: WorkerSender) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn handle_connection(&self, conn: Connection) {
        let body = format!("hello from app_worker {}\n", self.worker_id);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let written = match conn {
            Connection::Tcp { mut stream, .. } => stream.write_all(response.as_bytes()).await,
            Connection::Unix(mut stream) => stream.write_all(response.as_bytes()).await,
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "[app_worker] write failed");
        }
    }
}

/// Prints worker deaths and readiness.
struct Console;

#[async_trait]
impl Subscribe for Console {
    async fn on_event(&self, ev: &Event) {
        match ev.kind {
            EventKind::Ready => println!("[sub] ready on {}", ev.reason.as_deref().unwrap_or("?")),
            EventKind::WorkerDied => println!(
                "[sub] {} worker {} died (code {:?}, signal {:?})",
                ev.role.map(|r| r.as_str()).unwrap_or("?"),
                ev.worker_id.unwrap_or_default(),
                ev.code,
                ev.signal.as_deref()
            ),
            EventKind::AgentReforkScheduled => {
                println!("[sub] agent refork in {}ms", ev.delay_ms.unwrap_or_default())
            }
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

async fn worker(role: Role) -> i32 {
    let ctx = match WorkerContext::from_process(role) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(error = %err, "[{}_worker] cannot attach to master", role);
            return 1;
        }
    };
    match role {
        Role::Agent => run_agent(ctx, Heartbeat { ticker: None }).await,
        Role::App => {
            let worker_id = ctx.worker_id();
            run_app(ctx, Hello { worker_id }).await
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Some(role) = role_from_args() {
        std::process::exit(worker(role).await);
    }

    let options = ClusterOptions {
        framework: Some("demo".into()),
        workers: env_or("WORKERS", 2),
        port: Some(env_or("PORT", 7001)),
        ..Default::default()
    };
    let (master, handle) = Master::builder(options)
        .with_subscribers(vec![Arc::new(LogWriter), Arc::new(Console)])
        .build()?;

    tokio::spawn(async move {
        match handle.ready().await {
            Ok(info) => println!("try: curl {}", info.address),
            Err(err) => eprintln!("cluster did not start: {err}"),
        }
    });
    std::process::exit(master.run().await);
}
