//! Cloneable remote control of a running [`Master`](crate::Master).

use tokio::sync::{broadcast, mpsc, watch};

use super::master::Control;
use super::state::{Phase, ReadyInfo, Readiness};
use crate::error::ClusterError;
use crate::events::{Bus, Event};
use crate::message::{Endpoint, Message};

/// Talks to the master loop from other tasks.
///
/// Every method is non-blocking except [`MasterHandle::ready`].
#[derive(Clone)]
pub struct MasterHandle {
    relay: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedSender<Control>,
    readiness: watch::Receiver<Readiness>,
    phase: watch::Receiver<Phase>,
    bus: Bus,
}

impl MasterHandle {
    pub(crate) fn new(
        relay: mpsc::UnboundedSender<Message>,
        control: mpsc::UnboundedSender<Control>,
        readiness: watch::Receiver<Readiness>,
        phase: watch::Receiver<Phase>,
        bus: Bus,
    ) -> Self {
        Self {
            relay,
            control,
            readiness,
            phase,
            bus,
        }
    }

    /// Waits until every app worker listens; returns what the parent was told.
    ///
    /// Fails with [`ClusterError::NotReady`] when boot failed or the master closed first.
    pub async fn ready(&self) -> Result<ReadyInfo, ClusterError> {
        let mut rx = self.readiness.clone();
        let state = rx
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map_err(|_| ClusterError::Closed)?;
        match &*state {
            Readiness::Ready(info) => Ok(info.clone()),
            Readiness::Failed(reason) => Err(ClusterError::NotReady {
                reason: reason.clone(),
            }),
            Readiness::Pending => Err(ClusterError::Closed),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Requests a graceful close: app workers first, then the agent.
    pub fn close(&self) -> Result<(), ClusterError> {
        self.control.send(Control::Close).map_err(|_| ClusterError::Closed)
    }

    /// Replaces every app worker; the old ones are stopped once replacements are forked.
    pub fn reload(&self) -> Result<(), ClusterError> {
        self.control.send(Control::Reload).map_err(|_| ClusterError::Closed)
    }

    /// Routes `msg` as if the parent process had sent it.
    pub fn send(&self, msg: Message) -> Result<(), ClusterError> {
        self.relay
            .send(msg.with_from(Endpoint::Parent))
            .map_err(|_| ClusterError::Closed)
    }

    /// Subscribes to lifecycle events published from now on.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}
