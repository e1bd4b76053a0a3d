use std::os::fd::RawFd;
use std::sync::Arc;

use tokio::sync::{broadcast::error::RecvError, mpsc};

use super::handle::MasterHandle;
use super::master::{Master, MasterParts};
use crate::config::{ClusterOptions, MasterConfig, StartMode};
use crate::error::{ClusterError, ConfigError};
use crate::events::Bus;
use crate::ipc::{self, Frame, IPC_FD_ENV, IpcChannel};
use crate::message::Message;
use crate::messenger::ParentLink;
use crate::mode::{Launcher, ProcessLauncher, Role};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Builder for a [`Master`] and its [`MasterHandle`].
pub struct MasterBuilder {
    options: ClusterOptions,
    config: Option<MasterConfig>,
    launcher: Option<Arc<dyn Launcher>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    parent: Option<mpsc::UnboundedSender<Message>>,
    handle_signals: bool,
}

impl MasterBuilder {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            config: None,
            launcher: None,
            subscribers: Vec::new(),
            parent: None,
            handle_signals: true,
        }
    }

    /// Overrides the configuration read from the environment.
    pub fn with_config(mut self, config: MasterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets how workers are started.
    ///
    /// Defaults to re-executing the current binary in process mode; worker_threads
    /// mode always needs a [`ThreadLauncher`](crate::ThreadLauncher).
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Sets event subscribers for observability.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Delivers messages addressed to the parent into `parent` instead of the
    /// inherited IPC channel.
    pub fn with_parent(mut self, parent: mpsc::UnboundedSender<Message>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Whether SIGINT, SIGQUIT and SIGTERM close the cluster (default `true`).
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Validates the options and wires the master. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<(Master, MasterHandle), ClusterError> {
        let options = self.options.parse()?;
        let config = match self.config {
            Some(config) => config,
            None => MasterConfig::from_env()?,
        };

        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(launcher) => launcher,
            None if options.start_mode == StartMode::Process => {
                let launcher = ProcessLauncher::current_exe()
                    .map_err(|source| ClusterError::Spawn { role: Role::Agent, source })?;
                Arc::new(launcher)
            }
            None => return Err(ConfigError::MissingThreadEntries.into()),
        };
        if launcher.mode() != options.start_mode {
            return Err(ConfigError::ModeMismatch {
                launcher: launcher.mode().as_str(),
                options: options.start_mode.as_str(),
            }
            .into());
        }

        let bus = Bus::new(config.bus_capacity_clamped());
        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        subscriber_listener(&bus, subs);

        let (parent, parent_rx) = match self.parent {
            Some(tx) => (Some(ParentLink::Channel(tx)), None),
            None => inherited_parent(),
        };

        Ok(Master::new(MasterParts {
            options,
            config,
            launcher,
            bus,
            parent,
            parent_rx,
            handle_signals: self.handle_signals,
        }))
    }
}

/// Forwards bus events to the subscriber set (fire-and-forget).
fn subscriber_listener(bus: &Bus, set: SubscriberSet) {
    if set.is_empty() {
        return;
    }
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => set.emit(&ev),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "[master] subscriber listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        set.shutdown().await;
    });
}

/// Channel to the process that started this master, when it passed one.
fn inherited_parent() -> (Option<ParentLink>, Option<mpsc::UnboundedReceiver<Frame>>) {
    let Some(fd) = std::env::var(IPC_FD_ENV).ok().and_then(|v| v.parse::<RawFd>().ok()) else {
        return (None, None);
    };
    // SAFETY: the parent installed its channel at this descriptor for us.
    match unsafe { IpcChannel::from_raw(fd) } {
        Ok(channel) => {
            let (link, incoming) = ipc::attach(channel);
            (Some(ParentLink::Ipc(link)), Some(incoming))
        }
        Err(err) => {
            tracing::warn!(fd, error = %err, "[master] inherited parent channel unusable");
            (None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadLauncher;

    fn options() -> ClusterOptions {
        ClusterOptions {
            workers: 1,
            port: Some(7001),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_thread_mode_requires_a_launcher() {
        let options = ClusterOptions {
            start_mode: StartMode::WorkerThreads,
            ports: vec![7001],
            ..options()
        };
        let err = MasterBuilder::new(options)
            .with_config(MasterConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config(ConfigError::MissingThreadEntries)));
    }

    #[tokio::test]
    async fn test_launcher_mode_must_match_options() {
        let launcher = ThreadLauncher::new(|_ctx| async { 0 }, |_ctx| async { 0 });
        let err = MasterBuilder::new(options())
            .with_config(MasterConfig::default())
            .with_launcher(Arc::new(launcher))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config(ConfigError::ModeMismatch { .. })));
        assert_eq!(err.as_label(), "cluster_config");
    }
}
