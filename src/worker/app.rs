//! App worker entry.
//!
//! ```text
//! start() ──► realport {port, protocol} ──► bind ──► listening {address, port, addressType}
//!                                            │
//!        sticky:   127.0.0.1:stickyWorkerPort, plus sockets handed over in
//!                  "sticky-session:connection" frames
//!        path:     Unix socket
//!        default:  [hostname:]port with SO_REUSEPORT (process workers share it)
//! ```
//!
//! Every accepted connection is served on its own task. Shutdown closes the
//! application and exits 0; losing the master exits 110; start errors, start
//! timeouts and bind failures exit 1.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};

use super::{EXIT_DISCONNECTED, WorkerContext, WorkerSender, start_within};
use crate::config::ClusterOptions;
use crate::error::WorkerError;
use crate::ipc::Frame;
use crate::message::{Endpoint, Message};

/// Action of the frame carrying a sticky connection.
pub const STICKY_CONNECTION: &str = "sticky-session:connection";

/// Address type reported for Unix socket listeners.
const UNIX_ADDRESS_TYPE: i32 = -1;

/// A client connection accepted by (or handed to) an app worker.
#[derive(Debug)]
pub enum Connection {
    Tcp { stream: TcpStream, peer: SocketAddr },
    Unix(UnixStream),
}

/// The hosted request-serving application of an app worker.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Boots the application; the worker binds once this returns `Ok`.
    async fn start(&self, sender: WorkerSender) -> Result<(), WorkerError>;

    /// Serves one connection; runs on its own task.
    async fn handle_connection(&self, conn: Connection);

    /// A message routed to this worker.
    async fn on_message(&self, _msg: Message) {}

    /// Graceful shutdown hook.
    async fn close(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Connection> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok(Connection::Tcp { stream, peer })
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Connection::Unix(stream))
            }
        }
    }
}

/// Runs `app` until shutdown; returns the worker's exit code.
pub async fn run_app<A: Application>(mut ctx: WorkerContext, app: A) -> i32 {
    let app = Arc::new(app);
    let sender = ctx.sender();
    let shutdown = ctx.shutdown_token();
    let limit = ctx.options().start_timeout();

    let started = tokio::select! {
        res = start_within(limit, app.start(sender.clone())) => Some(res),
        _ = shutdown.cancelled() => None,
    };
    match started {
        None => return graceful_exit(app.as_ref()).await,
        Some(Err(WorkerError::StartTimeout)) => {
            tracing::error!(label = "worker_start_timeout", "[app_worker] start timeout, exiting with code:1");
            return 1;
        }
        Some(Err(err)) => {
            tracing::error!(error = %err, label = err.as_label(), "[app_worker] start error, exiting with code:1");
            return 1;
        }
        Some(Ok(())) => {}
    }

    let options = ctx.options().clone();
    let port = options.port.or(options.listen.port);
    let _ = sender.send(
        Message::new("realport")
            .with_to(Endpoint::Master)
            .with_data(json!({ "port": port, "protocol": options.protocol() })),
    );

    let (listener, address) = match bind(&options, port).await {
        Ok(bound) => bound,
        Err(err) => {
            tracing::error!(error = %err, "[app_worker] server got error, exiting with code:1");
            return 1;
        }
    };
    if sender
        .send(Message::new("listening").with_to(Endpoint::Master).with_data(address))
        .is_err()
    {
        return disconnected(app.as_ref()).await;
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return graceful_exit(app.as_ref()).await,
            frame = ctx.recv() => match frame {
                Some(Frame { message, connection }) => {
                    if message.action != STICKY_CONNECTION {
                        app.on_message(message).await;
                    } else if let Some(stream) = connection {
                        match stream.peer_addr() {
                            Ok(peer) => serve(&app, Connection::Tcp { stream, peer }),
                            Err(err) => tracing::debug!(error = %err, "[app_worker] sticky connection already closed"),
                        }
                    }
                }
                None => return disconnected(app.as_ref()).await,
            },
            accepted = listener.accept() => match accepted {
                Ok(conn) => serve(&app, conn),
                Err(err) => tracing::warn!(error = %err, "[app_worker] accept failed"),
            },
        }
    }
}

fn serve<A: Application>(app: &Arc<A>, conn: Connection) {
    let app = Arc::clone(app);
    tokio::spawn(async move { app.handle_connection(conn).await });
}

/// Binds the listener the options ask for; returns it with the reported address.
async fn bind(options: &ClusterOptions, port: Option<u16>) -> Result<(Listener, Value), WorkerError> {
    if options.sticky {
        if let Some(sticky_port) = options.sticky_worker_port {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), sticky_port);
            let listener = shared_listener(addr)?;
            let local = listener.local_addr()?;
            return Ok((Listener::Tcp(listener), tcp_address(local, Some("127.0.0.1"))));
        }
    }

    if let Some(path) = &options.listen.path {
        let listener = UnixListener::bind(path)?;
        let address = json!({
            "address": path.display().to_string(),
            "port": null,
            "addressType": UNIX_ADDRESS_TYPE,
        });
        return Ok((Listener::Unix(listener), address));
    }

    let port = port.ok_or_else(|| WorkerError::Start("port should be number, but got none".into()))?;
    let hostname = options.listen.hostname.as_deref();
    let ip: IpAddr = match hostname {
        Some(host) => resolve(host, port).await?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let listener = shared_listener(SocketAddr::new(ip, port))?;
    let local = listener.local_addr()?;
    Ok((Listener::Tcp(listener), tcp_address(local, hostname)))
}

/// Every app worker binds the same port.
fn shared_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn resolve(host: &str, port: u16) -> Result<IpAddr, WorkerError> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| WorkerError::Start(format!("hostname {host} did not resolve")))
}

fn tcp_address(local: SocketAddr, hostname: Option<&str>) -> Value {
    json!({
        "address": hostname,
        "port": local.port(),
        "addressType": if local.is_ipv4() { 4 } else { 6 },
    })
}

async fn graceful_exit<A: Application>(app: &A) -> i32 {
    if let Err(err) = app.close().await {
        tracing::error!(error = %err, "[app_worker] close error");
    }
    tracing::info!("[app_worker] exit with code:0");
    0
}

async fn disconnected<A: Application>(app: &A) -> i32 {
    tracing::error!("[app_worker] master disconnected, exiting with code:{}", EXIT_DISCONNECTED);
    let _ = app.close().await;
    EXIT_DISCONNECTED
}
