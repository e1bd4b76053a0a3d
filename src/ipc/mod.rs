//! # Master/worker message links.
//!
//! Every worker, whatever its launch mode, is reached through a [`Link`]: an
//! unbounded in-process queue of [`Frame`]s. In worker_threads mode the queue is read
//! directly by the worker task; in process mode [`attach`] pumps it into an
//! [`IpcChannel`] and pumps the channel back into a receiver.
//!
//! ```text
//! thread mode:   Link ──► mpsc ──────────────────────────────► worker task
//! process mode:  Link ──► mpsc ──► writer task ──► IpcChannel ══► worker process
//!                receiver ◄── reader task ◄── IpcChannel ◄══════ worker process
//! ```
//!
//! Sending never blocks the caller; a closed peer shows up as a send error and,
//! on the reading side, as the end of the receiver stream.

mod channel;

use std::os::fd::RawFd;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub use channel::{IpcChannel, MAX_PACKET, pair};
pub(crate) use channel::install_child_fd;

use crate::error::IpcError;
use crate::message::Message;

/// Environment variable naming the inherited channel descriptor of a worker process.
pub const IPC_FD_ENV: &str = "PROCVISOR_IPC_FD";
/// Descriptor number the channel is installed at in worker processes.
pub const CHILD_IPC_FD: RawFd = 3;

/// A message plus an optional socket handed over with it.
#[derive(Debug)]
pub struct Frame {
    pub message: Message,
    pub connection: Option<TcpStream>,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            connection: None,
        }
    }
}

/// Sending side of a message link.
#[derive(Clone, Debug)]
pub struct Link {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Link {
    /// Creates a link and the receiver its frames arrive at.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: Message) -> Result<(), IpcError> {
        self.send_frame(Frame::new(message))
    }

    /// Sends `message` together with ownership of `stream`.
    pub fn send_connection(&self, message: Message, stream: TcpStream) -> Result<(), IpcError> {
        self.send_frame(Frame {
            message,
            connection: Some(stream),
        })
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), IpcError> {
        self.tx.send(frame).map_err(|_| IpcError::Closed)
    }

    /// True once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Connects `channel` to a [`Link`] (outgoing) and a receiver (incoming).
///
/// Spawns a writer and a reader task. The receiver ends when the peer closes its
/// end of the channel. The channel closes once every clone of the link and the
/// receiver are dropped.
pub fn attach(channel: IpcChannel) -> (Link, mpsc::UnboundedReceiver<Frame>) {
    let channel = Arc::new(channel);
    let (link, mut outgoing) = Link::channel();
    let (incoming_tx, incoming) = mpsc::unbounded_channel();

    let writer = Arc::clone(&channel);
    tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            let action = frame.message.action.clone();
            match writer.send(frame).await {
                Ok(()) => {}
                Err(err @ (IpcError::TooLarge { .. } | IpcError::Decode(_))) => {
                    tracing::warn!(action = %action, error = %err, "[ipc] message dropped");
                }
                Err(err) => {
                    tracing::debug!(action = %action, error = %err, "[ipc] channel write failed");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let received = tokio::select! {
                _ = incoming_tx.closed() => break,
                received = channel.recv(&mut buf) => received,
            };
            match received {
                Ok(Some(frame)) => {
                    if incoming_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err @ (IpcError::TooLarge { .. } | IpcError::Decode(_))) => {
                    tracing::warn!(error = %err, "[ipc] malformed packet dropped");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "[ipc] channel read failed");
                    break;
                }
            }
        }
    });

    (link, incoming)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attached_pair_relays_both_ways() {
        let (a, b) = pair().unwrap();
        let (master, mut master_rx) = attach(IpcChannel::new(a).unwrap());
        let (worker, mut worker_rx) = attach(IpcChannel::new(b).unwrap());

        master.send(Message::new("egg-pids")).unwrap();
        assert_eq!(worker_rx.recv().await.unwrap().message.action, "egg-pids");

        worker.send(Message::new("agent-start")).unwrap();
        assert_eq!(master_rx.recv().await.unwrap().message.action, "agent-start");
    }

    #[tokio::test]
    async fn test_receiver_ends_when_peer_link_is_dropped() {
        let (a, b) = pair().unwrap();
        let (_master, mut master_rx) = attach(IpcChannel::new(a).unwrap());
        let (worker, worker_rx) = attach(IpcChannel::new(b).unwrap());

        drop(worker);
        drop(worker_rx);
        assert!(master_rx.recv().await.is_none());
    }

    #[test]
    fn test_send_on_closed_link_fails() {
        let (link, rx) = Link::channel();
        drop(rx);
        assert!(link.is_closed());
        assert!(matches!(link.send(Message::new("x")), Err(IpcError::Closed)));
    }
}
