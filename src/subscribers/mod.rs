//! # Event subscribers.
//!
//! Extension point for observing cluster lifecycle events published on the
//! [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Master / supervisors ── publish(Event) ──► Bus ──► subscriber listener
//!                                                        │
//!                                                        ▼
//!                                                  SubscriberSet
//!                                             ┌──────────┼──────────┐
//!                                             ▼          ▼          ▼
//!                                         LogWriter   Metrics    Custom
//! ```
//!
//! ## Contents
//! - [`Subscribe`] trait implemented by observers
//! - [`SubscriberSet`] per-subscriber queues, workers and panic isolation
//! - [`LogWriter`] built-in subscriber writing every event through `tracing`

mod log;
mod subscriber;
mod subscriber_set;

pub use log::LogWriter;
pub use subscriber::Subscribe;
pub use subscriber_set::SubscriberSet;
