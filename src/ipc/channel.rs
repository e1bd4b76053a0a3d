//! # Unix SEQPACKET channel.
//!
//! One JSON message per packet. A packet may carry one socket as `SCM_RIGHTS`
//! ancillary data; that is how the master hands sticky connections to process-mode
//! app workers.
//!
//! ```text
//!   master                                 worker process
//!   IpcChannel(parent end) ◄═══ socketpair(AF_UNIX, SOCK_SEQPACKET) ═══► fd 3
//!        sendmsg([json], [SCM_RIGHTS fd?])   ─────►   recvmsg
//! ```
//!
//! The worker end is installed as fd [`CHILD_IPC_FD`](super::CHILD_IPC_FD) in the
//! child between fork and exec; its number is passed in
//! [`IPC_FD_ENV`](super::IPC_FD_ENV).

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;

use super::Frame;
use crate::error::IpcError;
use crate::message::Message;

/// Largest message accepted in one packet.
pub const MAX_PACKET: usize = 256 * 1024;

/// Creates the connected pair `(master end, worker end)`.
///
/// Both ends are non-blocking and close-on-exec; the worker end is re-installed
/// without close-on-exec in the child.
pub fn pair() -> io::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)
}

/// Moves `fd` to `target` in a freshly forked child.
///
/// Only async-signal-safe calls; runs between fork and exec.
pub(crate) fn install_child_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd == target {
        fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        nix::unistd::dup2(fd, target)?;
    }
    Ok(())
}

/// Async wrapper over one end of the socketpair.
#[derive(Debug)]
pub struct IpcChannel {
    fd: AsyncFd<OwnedFd>,
}

impl IpcChannel {
    /// Registers `fd` with the Tokio reactor. Must be called inside a runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        // SAFETY: the `OwnedFd` keeps the descriptor open for as long as the
        // `AsyncFd` owns it.
        let fd = unsafe { AsyncFd::register(fd) }?;
        Ok(Self { fd })
    }

    /// Adopts an inherited descriptor.
    ///
    /// # Safety
    /// `fd` must be an open socket owned by nobody else in this process.
    pub unsafe fn from_raw(fd: RawFd) -> io::Result<Self> {
        // SAFETY: ownership is transferred by the caller.
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Sends one frame; an attached connection is moved to the peer.
    pub async fn send(&self, frame: Frame) -> Result<(), IpcError> {
        let payload = serde_json::to_vec(&frame.message)?;
        if payload.len() > MAX_PACKET {
            return Err(IpcError::TooLarge {
                size: payload.len(),
                limit: MAX_PACKET,
            });
        }
        let connection = frame.connection.map(TcpStream::into_std).transpose()?;
        let fds: Vec<RawFd> = connection.iter().map(|s| s.as_raw_fd()).collect();

        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|inner| {
                let iov = [IoSlice::new(&payload)];
                let rights = [ControlMessage::ScmRights(&fds)];
                let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
                sendmsg::<()>(inner.get_ref().as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            });
            match sent {
                Ok(result) => {
                    result?;
                    // our copy of the socket closes here; the peer owns its duplicate
                    drop(connection);
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives one frame into `buf`; `Ok(None)` once the peer closed its end.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Option<Frame>, IpcError> {
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|inner| {
                let mut iov = [IoSliceMut::new(&mut *buf)];
                let mut space = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(
                    inner.get_ref().as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                let truncated = msg.flags.contains(MsgFlags::MSG_TRUNC);
                Ok((msg.bytes, truncated, fds))
            });

            let (len, truncated, fds) = match received {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            // SAFETY: SCM_RIGHTS installed fresh descriptors owned by this process.
            let mut owned: Vec<OwnedFd> =
                fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();

            if len == 0 && owned.is_empty() {
                return Ok(None);
            }
            if truncated {
                return Err(IpcError::TooLarge {
                    size: len,
                    limit: buf.len(),
                });
            }
            let message: Message = serde_json::from_slice(&buf[..len])?;
            let connection = match owned.pop() {
                Some(fd) => {
                    let std = std::net::TcpStream::from(fd);
                    std.set_nonblocking(true)?;
                    Some(TcpStream::from_std(std)?)
                }
                None => None,
            };
            return Ok(Some(Frame {
                message,
                connection,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::message::Endpoint;

    fn connected() -> (IpcChannel, IpcChannel) {
        let (a, b) = pair().unwrap();
        (IpcChannel::new(a).unwrap(), IpcChannel::new(b).unwrap())
    }

    #[tokio::test]
    async fn test_message_crosses_the_pair() {
        let (master, worker) = connected();
        master
            .send(Frame::new(Message::new("egg-ready").with_to(Endpoint::App)))
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_PACKET];
        let frame = worker.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(frame.message.action, "egg-ready");
        assert!(frame.connection.is_none());
    }

    #[tokio::test]
    async fn test_socket_is_handed_over() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let (master, worker) = connected();
        master
            .send(Frame {
                message: Message::new("sticky-session:connection"),
                connection: Some(accepted),
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_PACKET];
        let frame = worker.recv(&mut buf).await.unwrap().unwrap();
        let mut stream = frame.connection.unwrap();
        stream.write_all(b"pong").await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn test_closed_peer_reads_none() {
        let (master, worker) = connected();
        drop(master);
        let mut buf = vec![0u8; 64];
        assert!(worker.recv(&mut buf).await.unwrap().is_none());
    }
}
