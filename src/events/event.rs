//! # Lifecycle events emitted by the master and its supervisors.
//!
//! [`EventKind`] classifies transitions in four groups:
//! - **Boot**: port detection, forks, starts, overall readiness
//! - **Steady state**: worker deaths, reforks, disconnects, health check
//! - **Shutdown**: signal observed, kill phases, master exit
//! - **Subscriber**: overflow and panic of event subscribers
//!
//! The [`Event`] struct carries the worker identity and exit details when they apply.
//!
//! ## Ordering guarantees
//! Each event has a globally unique, monotonically increasing sequence number (`seq`).
//!
//! ## Example
//! ```rust
//! use procvisor::{Event, EventKind, Role};
//!
//! let ev = Event::new(EventKind::WorkerDied)
//!     .with_worker(Role::App, 3, 4242)
//!     .with_exit(Some(1), None);
//!
//! assert_eq!(ev.kind, EventKind::WorkerDied);
//! assert_eq!(ev.worker_id, Some(4242));
//! assert_eq!(ev.code, Some(1));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::mode::Role;
use crate::WorkerId;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of cluster events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Boot ===
    /// Internal ports reserved.
    ///
    /// Sets: `port` (cluster port), `reason` (sticky worker port, if any)
    PortsDetected,

    /// A worker was launched.
    ///
    /// Sets: `role`, `id`, `worker_id`
    WorkerForked,

    /// The agent reported `agent-start`.
    ///
    /// Sets: `role`, `id`, `worker_id`
    AgentStarted,

    /// An app worker reported a matching listening address.
    ///
    /// Sets: `role`, `id`, `worker_id`, `port`
    AppListening,

    /// Every app worker started; the cluster is ready.
    ///
    /// Sets: `port`, `reason` (ready address)
    Ready,

    // === Steady state ===
    /// A worker exited.
    ///
    /// Sets: `role`, `id`, `worker_id`, `code`, `signal`
    WorkerDied,

    /// A new agent will be forked after `delay_ms`.
    ///
    /// Sets: `role`, `delay_ms`, `attempt`
    AgentReforkScheduled,

    /// A crashed app worker was replaced.
    ///
    /// Sets: `role`, `id`, `worker_id` (of the replacement)
    AppReforked,

    /// The refork rate limit refused a replacement.
    ///
    /// Sets: `role`, `worker_id` (of the dead worker)
    AppReforkRefused,

    /// An app worker's channel closed before it exited.
    ///
    /// Sets: `role`, `id`, `worker_id`
    AppDisconnected,

    /// A health check found neither the agent nor any app worker alive.
    ///
    /// Sets: `attempt` (consecutive failures)
    HealthCheckFailed,

    /// The health check gave up; the master stops with code 1.
    ///
    /// Sets: `reason` (alive counts)
    WorkerException,

    // === Shutdown ===
    /// Close requested (OS signal, handle or debugger kill).
    ///
    /// Sets: `signal` when caused by a signal
    ShutdownRequested,

    /// App workers are being terminated.
    ///
    /// Sets: `timeout_ms`
    KillingApps,

    /// The agent is being terminated.
    ///
    /// Sets: `timeout_ms`
    KillingAgent,

    /// The master loop finished.
    ///
    /// Sets: `code`
    MasterExited,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `subscriber`, `reason`
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `subscriber`, `reason`
    SubscriberOverflow,
}

/// Cluster event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Tier of the worker concerned.
    pub role: Option<Role>,
    /// Supervisor sequence id of the worker.
    pub id: Option<u64>,
    /// OS pid or thread id of the worker.
    pub worker_id: Option<WorkerId>,
    /// Exit code.
    pub code: Option<i32>,
    /// Terminating signal name (`SIGKILL`, ...).
    pub signal: Option<Arc<str>>,
    /// Port concerned.
    pub port: Option<u16>,
    /// Delay in milliseconds.
    pub delay_ms: Option<u32>,
    /// Timeout in milliseconds.
    pub timeout_ms: Option<u32>,
    /// Counter (consecutive crashes, failed checks).
    pub attempt: Option<u32>,
    /// Human-readable details.
    pub reason: Option<Arc<str>>,
    /// Subscriber name for subscriber events.
    pub subscriber: Option<&'static str>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            role: None,
            id: None,
            worker_id: None,
            code: None,
            signal: None,
            port: None,
            delay_ms: None,
            timeout_ms: None,
            attempt: None,
            reason: None,
            subscriber: None,
        }
    }

    /// Attaches the worker identity.
    #[inline]
    pub fn with_worker(mut self, role: Role, id: u64, worker_id: WorkerId) -> Self {
        self.role = Some(role);
        self.id = Some(id);
        self.worker_id = Some(worker_id);
        self
    }

    /// Attaches only the tier.
    #[inline]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Attaches exit details.
    #[inline]
    pub fn with_exit(mut self, code: Option<i32>, signal: Option<&str>) -> Self {
        self.code = code;
        self.signal = signal.map(Arc::from);
        self
    }

    #[inline]
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    #[inline]
    pub fn with_signal(mut self, signal: &str) -> Self {
        self.signal = Some(Arc::from(signal));
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(as_ms(d));
        self
    }

    /// Attaches a timeout (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(as_ms(d));
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        let mut ev = Event::new(EventKind::SubscriberOverflow).with_reason(reason);
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        let mut ev = Event::new(EventKind::SubscriberPanicked).with_reason(info);
        ev.subscriber = Some(subscriber);
        ev
    }
}

fn as_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}
