//! # Sticky connection dispatch.
//!
//! In sticky mode the master owns the public port. Every accepted connection is
//! handed to the app worker picked by the client ip:
//!
//! ```text
//! accept ─► ip "10.1.2.3" ─► digits "10123" ─► 10123 mod workers ─► index
//!                                                     │
//!   worker_ids()[index] ◄─────────────────────────────┘
//!        └─► link.send_connection("sticky-session:connection", socket)
//! ```
//!
//! The digits are read as one decimal number, not summed; the modulo is
//! computed digit by digit so long IPv6 addresses do not overflow. The hash is
//! stable per ip and not load aware.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connection accepted by the master-side sticky listener.
#[derive(Debug)]
pub(crate) struct StickyConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Index of the worker serving `ip` among `workers` slots.
///
/// `None` when there are no workers.
pub fn worker_index(ip: &str, workers: usize) -> Option<usize> {
    if workers == 0 {
        return None;
    }
    let n = workers as u128;
    let rem = ip
        .chars()
        .filter_map(|c| c.to_digit(10))
        .fold(0u128, |acc, d| (acc * 10 + u128::from(d)) % n);
    Some(rem as usize)
}

/// Binds the public sticky port on every interface.
pub(crate) async fn listen(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

/// Accepts until `stop` is cancelled or the receiver is gone.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<StickyConnection>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if tx.send(StickyConnection { stream, peer }).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "[master] sticky accept failed"),
            }
        }
    });
}
