//! Master runtime: boot sequencing, supervision and shutdown.
//!
//! The only public entry points are [`Master`], [`MasterBuilder`] and
//! [`MasterHandle`].
//!
//! Internal modules:
//! - [`master`]: the single-owner loop; dispatches lifecycle messages and timers;
//! - [`agent`]: fork, crash counting and kill of the agent slot;
//! - [`app`]: fork, boot counters, refork policy and kill of the app pool;
//! - [`sticky`]: master-side listener and client-ip routing;
//! - [`state`]: phase, readiness and the announced address;
//! - [`handle`]: cloneable remote control.

mod agent;
mod app;
mod builder;
mod handle;
mod master;
mod state;
mod sticky;

pub use builder::MasterBuilder;
pub use handle::MasterHandle;
pub use master::Master;
pub use state::{ListeningAddress, Phase, ReadyInfo, Readiness, ready_address};
pub use sticky::worker_index;
