//! # Logging subscriber.
//!
//! [`LogWriter`] writes every cluster event through `tracing` at debug level, one
//! line per event with the populated fields:
//!
//! ```text
//! DEBUG procvisor: [event] kind=WorkerForked role=agent id=1 worker_id=4242
//! DEBUG procvisor: [event] kind=WorkerDied role=app id=3 worker_id=4250 code=1
//! DEBUG procvisor: [event] kind=AgentReforkScheduled delay_ms=1000 attempt=1
//! ```
//!
//! The master already logs its own lifecycle messages; this subscriber is meant for
//! tracing the event stream itself.

use async_trait::async_trait;

use crate::events::Event;
use crate::subscribers::Subscribe;

/// Debug-level event logger.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        tracing::debug!(
            seq = e.seq,
            kind = ?e.kind,
            role = e.role.map(|r| r.as_str()),
            id = e.id,
            worker_id = e.worker_id,
            code = e.code,
            signal = e.signal.as_deref(),
            port = e.port,
            delay_ms = e.delay_ms,
            timeout_ms = e.timeout_ms,
            attempt = e.attempt,
            reason = e.reason.as_deref(),
            subscriber = e.subscriber,
            "[event]"
        );
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
