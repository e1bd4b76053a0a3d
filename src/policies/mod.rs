//! Refork policies.
//!
//! This module groups the knobs that control **when** a crashed worker is replaced.
//!
//! ## Contents
//! - [`BackoffPolicy`] delay before a crashed agent is forked again
//! - [`JitterPolicy`]  optional randomization of that delay
//! - [`ReforkPolicy`]  whether crashed app workers are replaced, and how often
//!
//! ## Quick wiring
//! ```text
//! MasterConfig { agent_backoff: BackoffPolicy, app_refork: ReforkPolicy, .. }
//!      ├─► agent exit (steady state) ─► agent_backoff.next(consecutive_crashes) ─► fork
//!      └─► app exit (steady state)   ─► ReforkWindow::allow(now)             ─► fork
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::constant(1s)` (fixed delay, no growth, no jitter).
//! - `ReforkPolicy::default()` → production only, at most 60 reforks per 60s.

mod backoff;
mod jitter;
mod refork;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use refork::{ReforkPolicy, ReforkWindow};
