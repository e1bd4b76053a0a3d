//! # Event subscriber trait.
//!
//! [`Subscribe`] is implemented by anything that wants to observe the cluster
//! (metrics exporters, audit trails, alerting).
//!
//! Each subscriber gets a dedicated worker task fed by its own bounded queue,
//! so a slow subscriber never stalls the master loop or other subscribers.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use procvisor::{Event, EventKind, Subscribe};
//!
//! struct CrashCounter;
//!
//! #[async_trait]
//! impl Subscribe for CrashCounter {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::WorkerDied) {
//!             // bump a counter
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "crash-counter" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Observer of cluster events.
///
/// ### Implementation requirements
/// - Use async I/O; avoid blocking the executor.
/// - Handle errors internally. Panics are caught and published as
///   `EventKind::SubscriberPanicked`.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes one event; events arrive in publish order.
    async fn on_event(&self, event: &Event);

    /// Name used in overflow/panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Queue capacity of this subscriber (min 1).
    ///
    /// When the queue is full the event is dropped for this subscriber only and
    /// an `EventKind::SubscriberOverflow` is published.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
