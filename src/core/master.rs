//! # Master: boot sequencing, lifecycle dispatch and ordered shutdown.
//!
//! The [`Master`] owns every piece of mutable cluster state and runs a single loop.
//! Nothing is shared with other tasks: pumps, timers, the sticky acceptor and the
//! [`MasterHandle`](crate::MasterHandle) only talk to it through channels.
//!
//! ## Boot
//! ```text
//! start() ─► pid file ─► detect ports (cluster port, sticky worker port)
//!         ─► fork agent ─► "agent-start" ─► fork app workers (once)
//!         ─► "app-start" × workers (matching port) ─► [sticky listen] ─► ready
//! ```
//!
//! ## Loop
//! ```text
//!   pumps ─┐                     ┌─► agent / app links
//!  handle ─┼─► relay ─► Messenger┼─► parent
//!  parent ─┘                     └─► dispatch ─► on_agent_start / on_app_exit / ...
//!  timers, signals, handle ─► control ─► fork agent / close / reload / health tick
//!  sticky acceptor ─► sticky ─► worker_index(ip) ─► app link (socket attached)
//! ```
//!
//! ## Failure policy
//! - Any worker death before the cluster is ready is fatal (exit code 1).
//! - After readiness a dead agent is forked again after the backoff delay; a dead
//!   app worker is replaced when the refork policy allows it.
//! - Three failed health checks in a row are fatal.
//! - [`MasterCore::fatal`] is the only place that sets a non-zero exit code.
//!   The loop then stops every remaining worker (bounded by the close timeouts)
//!   before [`Master::run`] returns.
//!
//! ## Shutdown
//! `close()` runs once: kill every app worker (bounded by the app timeout), then
//! the agent (bounded by the agent timeout), then exit with code 0. Exits reported
//! after `close()` started are ignored.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::agent::AgentSupervisor;
use super::app::{AppSupervisor, Refork, worker_options};
use super::builder::MasterBuilder;
use super::handle::MasterHandle;
use super::state::{ListeningAddress, Phase, ReadyInfo, Readiness, ready_address};
use super::sticky::{self, StickyConnection, worker_index};
use crate::WorkerId;
use crate::config::{ClusterOptions, MasterConfig, StartMode};
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind};
use crate::ipc::Frame;
use crate::manager::{AgentStatus, AppHandle, AppState, HealthCheck, WorkerManager};
use crate::message::{Endpoint, Message};
use crate::messenger::{Messenger, ParentLink};
use crate::mode::{Launcher, Role};
use crate::signals::wait_for_shutdown_signal;
use crate::worker::STICKY_CONNECTION;

/// Delay before closing when a debugged worker was killed.
const DEBUG_KILL_CLOSE_DELAY: Duration = Duration::from_millis(10);

/// Lifecycle lines go to debug level in local development, info otherwise.
macro_rules! master_log {
    ($core:expr, $($arg:tt)+) => {
        if $core.local {
            tracing::debug!($($arg)+)
        } else {
            tracing::info!($($arg)+)
        }
    };
}

/// Requests handled by the master loop that do not come from a worker.
#[derive(Debug)]
pub(crate) enum Control {
    /// Backoff elapsed; fork a new agent.
    ForkAgent,
    /// Graceful close requested.
    Close,
    /// Replace every app worker.
    Reload,
    /// Health check period elapsed.
    HealthTick,
    /// OS termination signal received.
    Signal(&'static str),
}

/// Everything [`MasterBuilder`] resolved.
pub(crate) struct MasterParts {
    pub options: ClusterOptions,
    pub config: MasterConfig,
    pub launcher: Arc<dyn Launcher>,
    pub bus: Bus,
    pub parent: Option<ParentLink>,
    pub parent_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    pub handle_signals: bool,
}

/// The cluster master.
///
/// Build it with [`Master::builder`], keep the [`MasterHandle`](crate::MasterHandle)
/// and drive it with [`Master::run`].
///
/// ## Example
/// ```no_run
/// use procvisor::{ClusterOptions, Master};
///
/// #[tokio::main]
/// async fn main() {
///     let options = ClusterOptions { workers: 2, port: Some(7001), ..Default::default() };
///     let (master, handle) = Master::builder(options).build().expect("valid options");
///
///     tokio::spawn(async move {
///         if let Ok(info) = handle.ready().await {
///             println!("serving on {}", info.address);
///         }
///     });
///     std::process::exit(master.run().await);
/// }
/// ```
pub struct Master {
    core: MasterCore,
    mailbox: Mailbox,
}

struct Mailbox {
    relay: mpsc::UnboundedReceiver<Message>,
    dispatch: mpsc::UnboundedReceiver<Message>,
    control: mpsc::UnboundedReceiver<Control>,
    sticky: mpsc::UnboundedReceiver<StickyConnection>,
    parent: Option<mpsc::UnboundedReceiver<Frame>>,
}

enum Next {
    Relay(Message),
    Dispatch(Message),
    Control(Control),
    Sticky(StickyConnection),
    Parent(Option<Frame>),
}

impl Master {
    /// Starts configuring a master for `options`.
    pub fn builder(options: ClusterOptions) -> MasterBuilder {
        MasterBuilder::new(options)
    }

    pub(crate) fn new(parts: MasterParts) -> (Self, MasterHandle) {
        let (relay_tx, relay) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let (sticky_tx, sticky) = mpsc::unbounded_channel();
        let (readiness, readiness_rx) = watch::channel(Readiness::Pending);
        let (phase, phase_rx) = watch::channel(Phase::Initializing);

        let MasterParts {
            options,
            config,
            launcher,
            bus,
            parent,
            parent_rx,
            handle_signals,
        } = parts;

        let handle = MasterHandle::new(
            relay_tx.clone(),
            control_tx.clone(),
            readiness_rx,
            phase_rx,
            bus.clone(),
        );
        let core = MasterCore {
            local: options.is_local(),
            production: options.is_production(),
            real_port: options.port,
            protocol: options.protocol().to_string(),
            next_debug_port: options.debug_port.unwrap_or(config.agent_debug_port),
            messenger: Messenger::new(std::process::id(), dispatch_tx, parent),
            workers: WorkerManager::new(),
            agent: AgentSupervisor::new(Arc::clone(&launcher), bus.clone()),
            apps: AppSupervisor::new(launcher, bus.clone(), config.app_refork),
            health: HealthCheck::new(config.health_interval, config.health_threshold),
            relay_tx,
            control_tx,
            sticky_tx,
            sticky_stop: CancellationToken::new(),
            readiness,
            phase,
            started_at: Instant::now(),
            closed: false,
            is_started: false,
            apps_forked: false,
            exit_code: None,
            handle_signals,
            options,
            config,
            bus,
        };
        let mailbox = Mailbox {
            relay,
            dispatch,
            control,
            sticky,
            parent: parent_rx,
        };
        (Self { core, mailbox }, handle)
    }

    /// Runs the cluster until it closes; returns the process exit code
    /// (`0` graceful close, `1` fatal failure).
    pub async fn run(self) -> i32 {
        let Master {
            mut core,
            mut mailbox,
        } = self;

        if core.handle_signals {
            core.spawn_signal_listener();
        }
        if let Err(err) = core.start().await {
            core.fatal(err);
        }

        while core.exit_code.is_none() {
            let next = tokio::select! {
                biased;
                Some(msg) = mailbox.dispatch.recv() => Next::Dispatch(msg),
                Some(ctl) = mailbox.control.recv() => Next::Control(ctl),
                Some(msg) = mailbox.relay.recv() => Next::Relay(msg),
                Some(conn) = mailbox.sticky.recv() => Next::Sticky(conn),
                frame = recv_parent(&mut mailbox.parent) => Next::Parent(frame),
                else => break,
            };
            match next {
                Next::Dispatch(msg) => core.dispatch(msg).await,
                Next::Control(ctl) => core.control(ctl).await,
                Next::Relay(msg) => core.messenger.send(msg, &core.workers),
                Next::Sticky(conn) => core.on_sticky_connection(conn),
                Next::Parent(Some(frame)) => {
                    let msg = frame.message.with_from(Endpoint::Parent);
                    core.messenger.send(msg, &core.workers);
                }
                Next::Parent(None) => {
                    tracing::debug!("[master] parent channel closed");
                    mailbox.parent = None;
                }
            }
        }
        if !core.closed {
            core.reap().await;
        }
        core.on_exit()
    }
}

async fn recv_parent(rx: &mut Option<mpsc::UnboundedReceiver<Frame>>) -> Option<Frame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExitData {
    worker_id: WorkerId,
    code: Option<i32>,
    signal: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartData {
    worker_id: WorkerId,
    #[serde(default)]
    address: ListeningAddress,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRef {
    worker_id: WorkerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentErrorData {
    worker_id: WorkerId,
    reason: String,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RealPort {
    port: Option<u16>,
    protocol: Option<String>,
}

struct MasterCore {
    options: ClusterOptions,
    config: MasterConfig,
    bus: Bus,
    local: bool,
    production: bool,

    workers: WorkerManager,
    messenger: Messenger,
    agent: AgentSupervisor,
    apps: AppSupervisor,
    health: HealthCheck,

    relay_tx: mpsc::UnboundedSender<Message>,
    control_tx: mpsc::UnboundedSender<Control>,
    sticky_tx: mpsc::UnboundedSender<StickyConnection>,
    sticky_stop: CancellationToken,

    readiness: watch::Sender<Readiness>,
    phase: watch::Sender<Phase>,

    started_at: Instant,
    real_port: Option<u16>,
    protocol: String,
    next_debug_port: u16,
    closed: bool,
    is_started: bool,
    apps_forked: bool,
    exit_code: Option<i32>,
    handle_signals: bool,
}

impl MasterCore {
    fn framework(&self) -> &str {
        self.options.framework.as_deref().unwrap_or("procvisor")
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn options_value(&self) -> Value {
        serde_json::to_value(&self.options).unwrap_or_default()
    }

    fn send(&mut self, to: Endpoint, action: &str, data: Option<Value>) {
        let mut msg = Message::new(action).with_to(to);
        msg.data = data;
        self.messenger.send(msg, &self.workers);
    }

    fn send_listening_pids(&mut self) {
        let ids = self.workers.listening_worker_ids();
        self.send(Endpoint::Agent, "egg-pids", Some(json!(ids)));
    }

    fn spawn_signal_listener(&self) {
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(signal) => {
                    let _ = tx.send(Control::Signal(signal));
                }
                Err(err) => tracing::warn!(error = %err, "[master] signal handlers not installed"),
            }
        });
    }

    async fn start(&mut self) -> Result<(), ClusterError> {
        let name = self.framework().to_string();
        master_log!(self, "[master] =================== {} start =====================", name);
        tracing::info!("[master] procvisor version {}", env!("CARGO_PKG_VERSION"));
        let options = self.options_value();
        if self.production {
            tracing::info!("[master] start with options:\n{:#}", options);
        } else {
            master_log!(self, "[master] start with options: {}", options);
        }
        master_log!(
            self,
            "[master] start with env: isProduction: {}, EGG_SERVER_ENV: {:?}, NODE_ENV: {:?}",
            self.production,
            self.options.env,
            std::env::var("NODE_ENV").ok(),
        );

        self.write_pid_file().await?;

        self.set_phase(Phase::DetectingPorts);
        let cluster_port = detect_port().await.map_err(|source| ClusterError::PortDetection { source })?;
        self.options.cluster_port = Some(cluster_port);
        let mut ev = Event::new(EventKind::PortsDetected).with_port(Some(cluster_port));
        if self.options.sticky {
            let sticky_port = detect_port().await.map_err(|source| ClusterError::PortDetection { source })?;
            self.options.sticky_worker_port = Some(sticky_port);
            ev = ev.with_reason(sticky_port.to_string());
        }
        self.bus.publish(ev);

        self.fork_agent()
    }

    async fn write_pid_file(&self) -> Result<(), ClusterError> {
        let Some(path) = &self.options.pid_file else {
            return Ok(());
        };
        let write = async {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, std::process::id().to_string()).await
        };
        write.await.map_err(|source| ClusterError::PidFile {
            path: path.clone(),
            source,
        })
    }

    fn fork_agent(&mut self) -> Result<(), ClusterError> {
        if !self.is_started {
            self.set_phase(Phase::ForkingAgent);
        }
        let handle = self.agent.fork(&self.options, &self.relay_tx)?;
        let worker_id = handle.worker_id;
        self.workers.set_agent(handle);

        if self.options.is_debug {
            let debug_port = self.config.agent_debug_port;
            let msg = Message::new("debug")
                .with_to(Endpoint::Parent)
                .with_from(Endpoint::Agent)
                .with_data(json!({ "debugPort": debug_port, "pid": worker_id, "workerId": worker_id }));
            self.messenger.send(msg, &self.workers);
        }
        if !self.is_started {
            self.set_phase(Phase::WaitingAgent);
        }
        Ok(())
    }

    fn fork_app_workers(&mut self) -> Result<(), ClusterError> {
        self.set_phase(Phase::ForkingApps);
        for handle in self.apps.fork_all(&self.options, &self.relay_tx)? {
            self.register_app(handle);
        }
        self.set_phase(Phase::WaitingApps);
        Ok(())
    }

    fn register_app(&mut self, handle: AppHandle) {
        let worker_id = handle.worker_id;
        self.workers.set_worker(handle);
        if self.options.is_debug {
            self.next_debug_port = self.next_debug_port.saturating_add(1);
            let msg = Message::new("debug")
                .with_to(Endpoint::Parent)
                .with_from(Endpoint::App)
                .with_data(json!({ "debugPort": self.next_debug_port, "pid": worker_id, "workerId": worker_id }));
            self.messenger.send(msg, &self.workers);
        }
    }

    /// Logs `err`, fails readiness and stops the loop with exit code 1.
    fn fatal(&mut self, err: ClusterError) {
        tracing::error!(label = err.as_label(), "{err}");
        self.health.stop();
        self.sticky_stop.cancel();
        let reason: Arc<str> = Arc::from(err.to_string());
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(reason);
                true
            } else {
                false
            }
        });
        self.exit_code.get_or_insert(1);
    }

    async fn dispatch(&mut self, msg: Message) {
        let from = msg.from.unwrap_or(Endpoint::Master);
        match (msg.action.as_str(), from) {
            ("agent-start", Endpoint::Agent) => self.on_agent_start(),
            ("agent-exit", Endpoint::Agent) => match msg.data_as::<ExitData>() {
                Some(exit) => self.on_agent_exit(exit),
                None => tracing::warn!("[master] malformed agent-exit"),
            },
            ("agent-error", Endpoint::Agent) => {
                if let Some(data) = msg.data_as::<AgentErrorData>() {
                    let id = self.agent.forks();
                    let err = ClusterError::AgentWorker {
                        id,
                        worker_id: data.worker_id,
                        reason: data.reason,
                    };
                    tracing::error!(label = err.as_label(), "{err}");
                }
            }
            ("app-start", Endpoint::App) => match msg.data_as::<StartData>() {
                Some(data) => self.on_app_start(data).await,
                None => tracing::warn!("[master] malformed app-start"),
            },
            ("app-exit", Endpoint::App) => match msg.data_as::<ExitData>() {
                Some(exit) => self.on_app_exit(exit),
                None => tracing::warn!("[master] malformed app-exit"),
            },
            ("app-disconnect", Endpoint::App) => {
                if let Some(data) = msg.data_as::<WorkerRef>() {
                    self.on_app_disconnect(data.worker_id);
                }
            }
            ("realport", Endpoint::App) => {
                let data = msg.data_as::<RealPort>().unwrap_or_default();
                if let Some(port) = data.port {
                    self.real_port = Some(port);
                }
                if let Some(protocol) = data.protocol {
                    self.protocol = protocol;
                }
            }
            ("reload-worker", _) => self.on_reload(),
            (action, from) => {
                tracing::debug!(action, from = from.as_str(), "[master] unhandled message");
            }
        }
    }

    async fn control(&mut self, ctl: Control) {
        match ctl {
            Control::ForkAgent => {
                if self.closed {
                    return;
                }
                tracing::info!("[master] new agent_worker starting...");
                if let Err(err) = self.fork_agent() {
                    self.fatal(err);
                }
            }
            Control::Close => {
                if !self.closed {
                    self.bus.publish(Event::new(EventKind::ShutdownRequested));
                }
                self.close().await;
            }
            Control::Reload => self.on_reload(),
            Control::HealthTick => self.on_health_tick(),
            Control::Signal(signal) => self.on_signal(signal).await,
        }
    }

    fn on_agent_start(&mut self) {
        let Some(agent) = self.workers.agent_mut() else {
            return;
        };
        agent.status = AgentStatus::Started;
        let (id, worker_id) = (agent.id, agent.worker_id);
        let elapsed = self.agent.started();
        self.bus
            .publish(Event::new(EventKind::AgentStarted).with_worker(Role::Agent, id, worker_id));

        if self.apps.all_started() {
            let options = self.options_value();
            self.send(Endpoint::Agent, "egg-ready", Some(options));
        }
        self.send(Endpoint::App, "egg-pids", Some(json!([worker_id])));
        if self.is_started {
            self.send_listening_pids();
        }
        self.send(Endpoint::App, "agent-start", None);
        tracing::info!(
            id,
            worker_id,
            "[master] agent_worker#{}:{} started ({}ms)",
            id,
            worker_id,
            elapsed.as_millis()
        );

        if !self.apps_forked {
            self.apps_forked = true;
            if let Err(err) = self.fork_app_workers() {
                self.fatal(err);
            }
        }
    }

    fn on_agent_exit(&mut self, exit: ExitData) {
        if self.closed {
            return;
        }
        self.send(Endpoint::App, "egg-pids", Some(json!([])));

        let (id, worker_id, status) = match self.workers.delete_agent() {
            Some(agent) => (agent.id, agent.worker_id, agent.status),
            None => (self.agent.forks(), exit.worker_id, AgentStatus::Starting),
        };
        let err = ClusterError::AgentDied {
            id,
            worker_id,
            code: exit.code,
            signal: exit.signal.clone(),
            status,
        };
        tracing::error!(id, worker_id, label = err.as_label(), "{err}");
        self.bus.publish(
            Event::new(EventKind::WorkerDied)
                .with_worker(Role::Agent, id, worker_id)
                .with_exit(exit.code, exit.signal.as_deref()),
        );
        self.agent.clean();

        if !self.is_started {
            self.fatal(ClusterError::StartFailed {
                role: Role::Agent,
                id,
                worker_id,
            });
            return;
        }

        let (delay, attempt) = self.agent.crashed(&self.config.agent_backoff);
        master_log!(self, "[master] try to start a new agent_worker after {}ms ...", delay.as_millis());
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Control::ForkAgent);
        });
        self.bus.publish(
            Event::new(EventKind::AgentReforkScheduled)
                .with_role(Role::Agent)
                .with_delay(delay)
                .with_attempt(attempt),
        );
        self.send(Endpoint::Parent, "agent-worker-died", None);
    }

    fn expects_port(&self, address: &ListeningAddress) -> bool {
        if self.options.sticky {
            return address.port.is_some() && address.port == self.options.sticky_worker_port;
        }
        self.options.start_mode == StartMode::WorkerThreads
            || address.is_unix_socket()
            || address.port == self.real_port
    }

    async fn on_app_start(&mut self, data: StartData) {
        let address = data.address;
        let Some(worker) = self.workers.worker_mut(data.worker_id) else {
            tracing::debug!(worker_id = data.worker_id, "[master] app-start from unknown worker ignored");
            return;
        };
        worker.state = AppState::Listening;
        let (id, worker_id) = (worker.id, worker.worker_id);

        if !self.expects_port(&address) {
            tracing::debug!(
                id,
                worker_id,
                port = address.port,
                "[master] app_worker#{}:{} listening on an unexpected port, ignored",
                id,
                worker_id
            );
            return;
        }
        self.send_listening_pids();
        if !self.apps.record_start(worker_id) {
            return;
        }

        let all_started = self.apps.all_started();
        let remain = if all_started {
            0
        } else {
            self.options.workers.saturating_sub(self.apps.start_success_count())
        };
        master_log!(
            self,
            "[master] app_worker#{}:{} started at {}, remain {} ({}ms)",
            id,
            worker_id,
            address.port.map(|p| p.to_string()).unwrap_or_default(),
            remain,
            self.apps.elapsed().as_millis()
        );
        self.bus.publish(
            Event::new(EventKind::AppListening)
                .with_worker(Role::App, id, worker_id)
                .with_port(address.port),
        );

        if all_started {
            let options = self.options_value();
            self.send(Endpoint::App, "egg-ready", Some(options));
            if let Some(worker) = self.workers.worker_mut(worker_id) {
                worker.disable_refork = false;
            }
            return;
        }
        if self.apps.start_success_count() < self.options.workers {
            return;
        }

        self.apps.mark_all_started();
        for worker in self.workers.workers_mut() {
            worker.disable_refork = false;
        }

        let port = if self.options.sticky { self.real_port } else { address.port };
        let info = ReadyInfo {
            port: self.real_port,
            debug_port: self.options.debug_port,
            address: ready_address(&address, port, &self.protocol, self.config.host.as_deref()),
            protocol: self.protocol.clone(),
        };

        if self.options.sticky {
            let listened = match self.real_port {
                Some(port) => sticky::listen(port).await,
                None => Err(io::Error::other("no public port configured")),
            };
            match listened {
                Ok(listener) => {
                    sticky::spawn_accept_loop(listener, self.sticky_tx.clone(), self.sticky_stop.clone());
                }
                Err(source) => {
                    return self.fatal(ClusterError::StickyListen {
                        port: self.real_port,
                        source,
                    });
                }
            }
        }
        self.ready(info);
    }

    fn ready(&mut self, info: ReadyInfo) {
        self.is_started = true;
        self.set_phase(Phase::Ready);

        let sticky = if self.options.sticky { " with STICKY MODE!" } else { "" };
        tracing::info!(
            "[master] {} started on {} ({}ms){}",
            self.framework(),
            info.address,
            self.started_at.elapsed().as_millis(),
            sticky
        );
        if let Some(debug_port) = self.options.debug_port {
            tracing::info!("[master] {} started debug port on http://127.0.0.1:{}", self.framework(), debug_port);
        }
        self.bus.publish(
            Event::new(EventKind::Ready)
                .with_port(info.port)
                .with_reason(info.address.as_str()),
        );

        let payload = serde_json::to_value(&info).unwrap_or_default();
        self.send(Endpoint::Parent, "egg-ready", Some(payload));
        let options = self.options_value();
        self.send(Endpoint::App, "egg-ready", Some(options.clone()));
        self.send(Endpoint::Agent, "egg-ready", Some(options));

        if self.production && self.config.health_check_interval().is_some() {
            let tx = self.control_tx.clone();
            self.health.start(move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Control::HealthTick);
                }
            });
        }
        self.readiness.send_replace(Readiness::Ready(info));
    }

    fn on_app_exit(&mut self, exit: ExitData) {
        if self.closed {
            return;
        }
        let Some(worker) = self.workers.worker(exit.worker_id).cloned() else {
            tracing::debug!(worker_id = exit.worker_id, "[master] app-exit from unknown worker ignored");
            return;
        };
        let (id, worker_id) = (worker.id, worker.worker_id);
        self.bus.publish(
            Event::new(EventKind::WorkerDied)
                .with_worker(Role::App, id, worker_id)
                .with_exit(exit.code, exit.signal.as_deref()),
        );

        let mut debug_kill = false;
        if !worker.is_dev_reload {
            let err = ClusterError::AppDied {
                id,
                worker_id,
                code: exit.code,
                signal: exit.signal.clone(),
                state: worker.state,
                current: self.workers.worker_ids(),
            };
            if self.options.is_debug && exit.signal.as_deref() == Some("SIGKILL") {
                debug_kill = true;
                tracing::error!(id, worker_id, "{err}");
                tracing::error!("[master] worker kill by debugger, exiting...");
                let tx = self.control_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEBUG_KILL_CLOSE_DELAY).await;
                    let _ = tx.send(Control::Close);
                });
            } else {
                tracing::error!(id, worker_id, label = err.as_label(), "{err}");
            }
        }

        self.apps.forget(worker_id);
        self.workers.delete_worker(worker_id);
        self.send_listening_pids();

        if !self.apps.all_started() {
            self.fatal(ClusterError::StartFailed {
                role: Role::App,
                id,
                worker_id,
            });
            return;
        }
        if !debug_kill {
            self.refork_app(&worker);
        }
        self.send(Endpoint::Parent, "app-worker-died", None);
    }

    fn refork_app(&mut self, dead: &AppHandle) {
        match self.apps.refork(dead, self.production) {
            Refork::Disabled => {}
            Refork::Refused => {
                let policy = self.config.app_refork;
                tracing::error!(
                    id = dead.id,
                    worker_id = dead.worker_id,
                    "[master] app_worker#{}:{} not reforked: more than {} reforks within {}ms",
                    dead.id,
                    dead.worker_id,
                    policy.limit,
                    policy.window.as_millis()
                );
                self.bus.publish(
                    Event::new(EventKind::AppReforkRefused)
                        .with_role(Role::App)
                        .with_reason(dead.worker_id.to_string()),
                );
            }
            Refork::Allowed => {
                let options = ClusterOptions {
                    port: dead.port,
                    ..self.options.clone()
                };
                match self.apps.fork_one(&options, &self.relay_tx) {
                    Ok(handle) => {
                        master_log!(
                            self,
                            "[master] app_worker#{}:{} replaced by app_worker#{}:{}",
                            dead.id,
                            dead.worker_id,
                            handle.id,
                            handle.worker_id
                        );
                        self.bus.publish(
                            Event::new(EventKind::AppReforked).with_worker(Role::App, handle.id, handle.worker_id),
                        );
                        self.register_app(handle);
                    }
                    Err(err) => tracing::error!(label = err.as_label(), "[master] refork app_worker failed: {err}"),
                }
            }
        }
    }

    fn on_app_disconnect(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.worker_mut(worker_id) else {
            return;
        };
        if worker.state == AppState::Dead {
            return;
        }
        worker.state = AppState::Disconnected;
        let id = worker.id;
        tracing::debug!(id, worker_id, "[master] app_worker#{}:{} disconnect", id, worker_id);
        self.bus
            .publish(Event::new(EventKind::AppDisconnected).with_worker(Role::App, id, worker_id));
    }

    fn on_reload(&mut self) {
        if self.closed {
            return;
        }
        if !self.apps.all_started() {
            tracing::warn!("[master] reload ignored, app workers are still starting");
            return;
        }
        master_log!(self, "[master] reload {} workers...", self.options.workers);
        let old = self.workers.worker_ids();
        for worker in self.workers.workers_mut() {
            worker.is_dev_reload = true;
            worker.disable_refork = true;
        }
        for options in worker_options(&self.options) {
            match self.apps.fork_one(&options, &self.relay_tx) {
                Ok(handle) => self.register_app(handle),
                Err(err) => tracing::error!(label = err.as_label(), "[master] reload fork failed: {err}"),
            }
        }
        self.apps.retire(&old, self.config.app_close_timeout);
    }

    fn on_health_tick(&mut self) {
        // A tick queued before the ticker stopped.
        if self.closed || !self.health.is_running() {
            return;
        }
        let count = self.workers.count();
        match self.health.observe(count) {
            Some(count) => {
                self.bus.publish(
                    Event::new(EventKind::WorkerException)
                        .with_reason(format!("agent={} worker={}", count.agent, count.worker)),
                );
                self.fatal(ClusterError::WorkerException {
                    agent: count.agent,
                    worker: count.worker,
                });
            }
            None if self.health.failures() > 0 => {
                self.bus
                    .publish(Event::new(EventKind::HealthCheckFailed).with_attempt(self.health.failures()));
            }
            None => {}
        }
    }

    fn on_sticky_connection(&mut self, conn: StickyConnection) {
        let ip = conn.peer.ip().to_string();
        let ids = self.workers.worker_ids();
        let target = worker_index(&ip, self.options.workers)
            .and_then(|index| ids.get(index).copied())
            .and_then(|worker_id| self.workers.worker(worker_id));
        let Some(worker) = target else {
            tracing::warn!(ip = %ip, "[master] no app worker for sticky connection");
            return;
        };
        let msg = Message::new(STICKY_CONNECTION).with_from(Endpoint::Master);
        if let Err(err) = worker.link.send_connection(msg, conn.stream) {
            tracing::debug!(worker_id = worker.worker_id, error = %err, "[master] sticky hand-off failed");
        }
    }

    async fn on_signal(&mut self, signal: &'static str) {
        if self.closed {
            return;
        }
        tracing::info!("[master] master is killed by signal {}, closing", signal);
        log_memory();
        self.bus
            .publish(Event::new(EventKind::ShutdownRequested).with_signal(signal));
        self.close().await;
    }

    /// Stops the workers a fatal failure left behind, without the ordered
    /// close. Process workers would otherwise outlive a master whose caller
    /// keeps running after [`Master::run`] returned.
    async fn reap(&mut self) {
        self.closed = true;
        self.apps.kill(&mut self.workers, self.config.app_close_timeout).await;
        self.agent.kill(self.config.agent_close_timeout).await;
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.set_phase(Phase::Closing);
        self.health.stop();
        self.sticky_stop.cancel();
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(Arc::from("closed before ready"));
                true
            } else {
                false
            }
        });

        let app_timeout = self.config.app_close_timeout;
        tracing::info!(
            "[master] send kill SIGTERM to app workers, will exit with code:0 after {}ms",
            app_timeout.as_millis()
        );
        tracing::info!("[master] wait {}ms", app_timeout.as_millis());
        self.bus
            .publish(Event::new(EventKind::KillingApps).with_timeout(app_timeout));
        self.apps.kill(&mut self.workers, app_timeout).await;

        let agent_timeout = self.config.agent_close_timeout;
        tracing::info!(
            "[master] send kill SIGTERM to agent worker, will exit with code:0 after {}ms",
            agent_timeout.as_millis()
        );
        tracing::info!("[master] wait {}ms", agent_timeout.as_millis());
        self.bus
            .publish(Event::new(EventKind::KillingAgent).with_timeout(agent_timeout));
        self.agent.kill(agent_timeout).await;

        master_log!(self, "[master] close done, exiting with code:0");
        self.exit_code.get_or_insert(0);
    }

    fn on_exit(mut self) -> i32 {
        let code = self.exit_code.unwrap_or(0);
        if let Some(path) = self.options.pid_file.as_ref().filter(|p| p.exists()) {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::error!("[master] delete pidFile {} fail with {}", path.display(), err);
            }
        }
        if code == 0 {
            tracing::info!("[master] exit with code:{}", code);
        } else {
            tracing::error!("[master] exit with code:{}", code);
        }
        self.health.stop();
        self.sticky_stop.cancel();
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(Arc::from("master exited"));
                true
            } else {
                false
            }
        });
        self.bus
            .publish(Event::new(EventKind::MasterExited).with_exit(Some(code), None));
        self.set_phase(Phase::Exited);
        code
    }
}

/// Reserves a free TCP port by binding port 0.
async fn detect_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    Ok(listener.local_addr()?.port())
}

fn log_memory() {
    let mut system = System::new();
    system.refresh_memory();
    tracing::info!(
        "[master] system memory: total {}, free {}",
        system.total_memory(),
        system.free_memory()
    );
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(process) = system.process(pid) {
        tracing::info!(
            "[master] process info: rss {}, virtual {}",
            process.memory(),
            process.virtual_memory()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ipc::Link;
    use crate::mode::{Instance, InstanceControl, SpawnRequest};
    use crate::policies::ReforkPolicy;

    /// Launcher whose workers never run; the test plays their part on the relay.
    #[derive(Default)]
    struct Scripted {
        calls: Arc<Mutex<Vec<String>>>,
        next: Mutex<WorkerId>,
    }

    struct ScriptedControl {
        role: Role,
        worker_id: WorkerId,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl InstanceControl for ScriptedControl {
        fn detach(&self) {}

        async fn terminate(&self, _timeout: Duration) {
            tokio::task::yield_now().await;
            self.calls
                .lock()
                .unwrap()
                .push(format!("terminate {} {}", self.role, self.worker_id));
        }
    }

    impl Launcher for Scripted {
        fn mode(&self) -> StartMode {
            StartMode::Process
        }

        fn spawn(&self, request: SpawnRequest<'_>) -> Result<Instance, ClusterError> {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            self.calls
                .lock()
                .unwrap()
                .push(format!("fork {} {}", request.role, *next));
            Ok(Instance {
                worker_id: *next,
                link: Link::channel().0,
                control: Box::new(ScriptedControl {
                    role: request.role,
                    worker_id: *next,
                    calls: Arc::clone(&self.calls),
                }),
            })
        }
    }

    struct Fixture {
        core: MasterCore,
        calls: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(workers: usize) -> Fixture {
        fixture_with(workers, |_, _| {})
    }

    fn fixture_with(workers: usize, tweak: impl FnOnce(&mut ClusterOptions, &mut MasterConfig)) -> Fixture {
        let launcher = Arc::new(Scripted::default());
        let calls = Arc::clone(&launcher.calls);
        let mut options = ClusterOptions {
            workers,
            port: Some(7001),
            env: Some("prod".into()),
            ..Default::default()
        };
        let mut config = MasterConfig {
            app_refork: ReforkPolicy {
                enabled: Some(true),
                ..Default::default()
            },
            health_interval: Duration::ZERO,
            ..Default::default()
        };
        tweak(&mut options, &mut config);
        let (master, _handle) = Master::new(MasterParts {
            options,
            config,
            launcher,
            bus: Bus::new(64),
            parent: None,
            parent_rx: None,
            handle_signals: false,
        });
        Fixture {
            core: master.core,
            calls,
        }
    }

    fn app_start(worker_id: WorkerId, port: u16) -> StartData {
        StartData {
            worker_id,
            address: ListeningAddress {
                address: None,
                port: Some(port),
                address_type: Some(4),
            },
        }
    }

    fn exit(worker_id: WorkerId, code: i32) -> ExitData {
        ExitData {
            worker_id,
            code: Some(code),
            signal: None,
        }
    }

    async fn boot(f: &mut Fixture) {
        f.core.fork_agent().unwrap();
        f.core.on_agent_start();
        for worker_id in f.core.workers.worker_ids() {
            f.core.on_app_start(app_start(worker_id, 7001)).await;
        }
    }

    #[tokio::test]
    async fn test_apps_fork_only_after_agent_start() {
        let mut f = fixture(2);
        f.core.fork_agent().unwrap();
        assert_eq!(f.core.workers.worker_ids().len(), 0);
        assert_eq!(*f.core.phase.borrow(), Phase::WaitingAgent);

        f.core.on_agent_start();
        f.core.on_agent_start();
        assert_eq!(f.core.workers.worker_ids().len(), 2);
        assert_eq!(*f.core.phase.borrow(), Phase::WaitingApps);
    }

    #[tokio::test]
    async fn test_ready_once_all_workers_listen_on_the_real_port() {
        let mut f = fixture(2);
        f.core.fork_agent().unwrap();
        f.core.on_agent_start();
        let ids = f.core.workers.worker_ids();

        f.core.on_app_start(app_start(ids[0], 9999)).await;
        f.core.on_app_start(app_start(ids[0], 7001)).await;
        f.core.on_app_start(app_start(ids[0], 7001)).await;
        assert!(!f.core.is_started);
        assert_eq!(f.core.apps.start_success_count(), 1);

        f.core.on_app_start(app_start(ids[1], 7001)).await;
        assert!(f.core.is_started);
        assert_eq!(f.core.workers.listening_worker_ids(), ids);
        assert!(f.core.workers.workers().all(|w| !w.disable_refork));
        match &*f.core.readiness.borrow() {
            Readiness::Ready(info) => assert_eq!(info.address, "http://127.0.0.1:7001"),
            other => panic!("unexpected readiness {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_app_death_during_boot_is_fatal() {
        let mut f = fixture(2);
        f.core.fork_agent().unwrap();
        f.core.on_agent_start();
        let ids = f.core.workers.worker_ids();
        f.core.on_app_start(app_start(ids[0], 7001)).await;

        f.core.on_app_exit(exit(ids[1], 1));
        assert_eq!(f.core.exit_code, Some(1));
        assert!(matches!(&*f.core.readiness.borrow(), Readiness::Failed(_)));
        let forks = f.calls.lock().unwrap().iter().filter(|c| c.starts_with("fork app")).count();
        assert_eq!(forks, 2);

        f.core.reap().await;
        let calls = f.calls.lock().unwrap().clone();
        assert!(calls.contains(&format!("terminate app {}", ids[0])));
        assert!(!calls.contains(&format!("terminate app {}", ids[1])));
        assert!(calls.iter().any(|c| c.starts_with("terminate agent")));
    }

    #[tokio::test]
    async fn test_agent_death_during_boot_is_fatal() {
        let mut f = fixture(1);
        f.core.fork_agent().unwrap();
        let agent = f.core.workers.agent().unwrap().worker_id;

        f.core.on_agent_exit(exit(agent, 1));
        assert_eq!(f.core.exit_code, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_death_after_ready_schedules_refork() {
        let mut f = fixture(1);
        boot(&mut f).await;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        f.core.control_tx = control_tx;
        let agent = f.core.workers.agent().unwrap().worker_id;

        f.core.on_agent_exit(exit(agent, 1));
        assert_eq!(f.core.exit_code, None);
        assert!(f.core.workers.agent().is_none());

        let started = Instant::now();
        assert!(matches!(control_rx.recv().await, Some(Control::ForkAgent)));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_app_death_after_ready_is_reforked() {
        let mut f = fixture(2);
        boot(&mut f).await;
        let dead = f.core.workers.worker_ids()[0];

        f.core.on_app_exit(exit(dead, 1));
        assert_eq!(f.core.exit_code, None);
        let ids = f.core.workers.worker_ids();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&dead));
        let replacement = f.core.workers.worker(ids[1]).unwrap();
        assert!(replacement.disable_refork);

        f.core.on_app_start(app_start(ids[1], 7001)).await;
        assert!(!f.core.workers.worker(ids[1]).unwrap().disable_refork);
        assert_eq!(f.core.apps.start_success_count(), 2);
    }

    #[tokio::test]
    async fn test_close_kills_apps_before_agent_and_ignores_later_exits() {
        let mut f = fixture(2);
        boot(&mut f).await;
        let agent = f.core.workers.agent().unwrap().worker_id;

        f.core.close().await;
        f.core.close().await;
        f.core.on_agent_exit(exit(agent, 0));
        assert_eq!(f.core.exit_code, Some(0));

        let calls = f.calls.lock().unwrap().clone();
        let kills: Vec<_> = calls.iter().filter(|c| c.starts_with("terminate")).collect();
        assert_eq!(kills.len(), 3);
        assert!(kills[0].starts_with("terminate app"));
        assert!(kills[1].starts_with("terminate app"));
        assert_eq!(kills[2], &format!("terminate agent {agent}"));
    }

    #[tokio::test]
    async fn test_reload_replaces_every_worker_quietly() {
        let mut f = fixture(2);
        boot(&mut f).await;
        let old = f.core.workers.worker_ids();

        f.core.on_reload();
        assert_eq!(f.core.workers.worker_ids().len(), 4);
        assert!(old.iter().all(|id| f.core.workers.worker(*id).unwrap().is_dev_reload));

        f.core.on_app_exit(exit(old[0], 0));
        assert_eq!(f.core.exit_code, None);
        assert_eq!(f.core.workers.worker_ids().len(), 3);
    }

    fn apps_forked(f: &Fixture) -> usize {
        f.calls.lock().unwrap().iter().filter(|c| c.starts_with("fork app")).count()
    }

    #[tokio::test]
    async fn test_debugger_kill_after_ready_closes_instead_of_reforking() {
        let mut f = fixture_with(2, |options, _| options.is_debug = true);
        boot(&mut f).await;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        f.core.control_tx = control_tx;
        let killed = f.core.workers.worker_ids()[0];

        f.core.on_app_exit(ExitData {
            worker_id: killed,
            code: None,
            signal: Some("SIGKILL".into()),
        });
        assert_eq!(f.core.exit_code, None);
        assert_eq!(apps_forked(&f), 2);
        assert_eq!(f.core.workers.worker_ids().len(), 1);

        let ctl = control_rx.recv().await.unwrap();
        assert!(matches!(ctl, Control::Close));
        f.core.control(ctl).await;
        assert_eq!(f.core.exit_code, Some(0));
        assert_eq!(apps_forked(&f), 2);
    }

    #[tokio::test]
    async fn test_three_empty_health_checks_are_fatal() {
        let mut f = fixture_with(1, |_, config| config.health_interval = Duration::from_secs(10));
        boot(&mut f).await;
        assert!(f.core.health.is_running());
        let mut events = f.core.bus.subscribe();

        f.core.workers.delete_agent();
        for worker_id in f.core.workers.worker_ids() {
            f.core.workers.delete_worker(worker_id);
        }
        f.core.on_health_tick();
        f.core.on_health_tick();
        assert_eq!(f.core.exit_code, None);

        f.core.on_health_tick();
        assert_eq!(f.core.exit_code, Some(1));
        assert!(!f.core.health.is_running());

        f.core.on_health_tick();
        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert_eq!(
            kinds,
            vec![EventKind::HealthCheckFailed, EventKind::HealthCheckFailed, EventKind::WorkerException]
        );
    }

    #[tokio::test]
    async fn test_pid_file_is_written_at_start_and_removed_on_exit() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("procvisor-pid-{}-{}", std::process::id(), nanos));
        let path = root.join("run").join("nested").join("master.pid");
        let pid_file = path.clone();
        let mut f = fixture_with(1, move |options, _| options.pid_file = Some(pid_file));

        f.core.start().await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, std::process::id().to_string());
        assert!(f.core.options.cluster_port.is_some());

        assert_eq!(f.core.on_exit(), 0);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_signal_after_close_is_ignored() {
        let mut f = fixture(1);
        boot(&mut f).await;
        let mut events = f.core.bus.subscribe();

        f.core.on_signal("SIGTERM").await;
        assert_eq!(f.core.exit_code, Some(0));
        let kills = f.calls.lock().unwrap().len();

        f.core.on_signal("SIGINT").await;
        assert_eq!(f.calls.lock().unwrap().len(), kills);
        let mut requested = 0;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::ShutdownRequested {
                requested += 1;
            }
        }
        assert_eq!(requested, 1);
    }
}
