//! Cluster lifecycle events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to publish and
//! subscribe to lifecycle transitions emitted by the master and its supervisors.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Master`, `AgentSupervisor`, `AppSupervisor`, `SubscriberSet`
//!   workers (overflow/panic).
//! - **Consumers**: the master's subscriber listener (fans out to `SubscriberSet`) and
//!   anyone holding [`MasterHandle::events`](crate::MasterHandle::events).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
