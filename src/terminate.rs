//! # Worker process termination.
//!
//! [`terminate`] stops a worker process and everything it spawned:
//!
//! ```text
//! descendants(pid) ── best effort, empty on failure
//!        │
//!        ├─► main:     SIGTERM pid ─► race(exit, timeout) ─► SIGKILL pid if still running
//!        │
//!        └─► children: SIGTERM each ─► every 400ms liveness check (signal 0)
//!                      until timeout - 400ms ─► SIGKILL the ones still alive
//! ```
//!
//! Both branches run concurrently; `terminate` returns once both finished.
//! Signal errors (already exited, not permitted) are logged and swallowed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use nix::sys::signal::Signal;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::Instant;

/// Poll period of the children liveness check.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Signal delivery and process tree discovery.
pub trait ProcessSignals: Send + Sync + 'static {
    /// Sends `signal` to `pid`; `None` only checks for existence.
    fn kill(&self, pid: u32, signal: Option<Signal>) -> nix::Result<()>;

    /// Every descendant of `pid` (children, grandchildren, ...), excluding `pid`.
    fn descendants(&self, pid: u32) -> Vec<u32>;
}

/// Real signals through `kill(2)`, process tree from the OS process table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSignals;

impl ProcessSignals for SystemSignals {
    fn kill(&self, pid: u32, signal: Option<Signal>) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child);
            }
        }

        let mut found = Vec::new();
        let mut queue = VecDeque::from([Pid::from_u32(pid)]);
        while let Some(next) = queue.pop_front() {
            for child in children.remove(&next).unwrap_or_default() {
                found.push(child.as_u32());
                queue.push_back(child);
            }
        }
        found
    }
}

/// Terminates `pid` and its descendants.
///
/// `exited` flips to `true` once the worker process has been reaped.
pub async fn terminate(
    signals: &dyn ProcessSignals,
    pid: u32,
    exited: watch::Receiver<bool>,
    timeout: Duration,
) {
    let children = signals.descendants(pid);
    tokio::join!(
        kill_process(signals, pid, exited, timeout),
        kill_children(signals, &children, timeout),
    );
}

async fn kill_process(
    signals: &dyn ProcessSignals,
    pid: u32,
    mut exited: watch::Receiver<bool>,
    timeout: Duration,
) {
    send(signals, pid, Signal::SIGTERM);
    // a dropped sender means the exit watcher is gone, i.e. the process was reaped
    let stopped = tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .is_ok();
    if !stopped {
        tracing::warn!(pid, timeout_ms = timeout.as_millis() as u64, "[master] worker did not exit in time, sending SIGKILL");
        send(signals, pid, Signal::SIGKILL);
    }
}

async fn kill_children(signals: &dyn ProcessSignals, pids: &[u32], timeout: Duration) {
    if pids.is_empty() {
        return;
    }
    for pid in pids {
        send(signals, *pid, Signal::SIGTERM);
    }

    let start = Instant::now();
    let deadline = timeout.saturating_sub(CHILD_POLL_INTERVAL);
    let mut alive = pids.to_vec();
    while start.elapsed() < deadline {
        tokio::time::sleep(CHILD_POLL_INTERVAL).await;
        alive.retain(|pid| signals.kill(*pid, None).is_ok());
        if alive.is_empty() {
            return;
        }
    }

    alive.retain(|pid| signals.kill(*pid, None).is_ok());
    for pid in alive {
        tracing::warn!(pid, "[master] child process still alive, sending SIGKILL");
        send(signals, pid, Signal::SIGKILL);
    }
}

fn send(signals: &dyn ProcessSignals, pid: u32, signal: Signal) {
    if let Err(errno) = signals.kill(pid, Some(signal)) {
        tracing::debug!(pid, signal = signal.as_str(), error = %errno, "[master] signal not delivered");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records signals; a pid dies when its kill signal is in `fatal`.
    #[derive(Default)]
    struct Recorder {
        children: Vec<u32>,
        fatal: HashMap<u32, Signal>,
        dead: Mutex<HashSet<u32>>,
        sent: Mutex<Vec<(u32, Signal, Duration)>>,
        start: Option<Instant>,
    }

    impl ProcessSignals for Recorder {
        fn kill(&self, pid: u32, signal: Option<Signal>) -> nix::Result<()> {
            let mut dead = self.dead.lock().unwrap();
            if dead.contains(&pid) {
                return Err(nix::errno::Errno::ESRCH);
            }
            if let Some(signal) = signal {
                let at = self.start.map(|s| s.elapsed()).unwrap_or_default();
                self.sent.lock().unwrap().push((pid, signal, at));
                if self.fatal.get(&pid) == Some(&signal) {
                    dead.insert(pid);
                }
            }
            Ok(())
        }

        fn descendants(&self, _pid: u32) -> Vec<u32> {
            self.children.clone()
        }
    }

    fn signals_for(rec: &Recorder, pid: u32) -> Vec<(Signal, Duration)> {
        rec.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| *p == pid)
            .map(|(_, s, at)| (*s, *at))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exiting_in_time_never_gets_sigkill() {
        let rec = Recorder {
            start: Some(Instant::now()),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(true);
        });

        terminate(&rec, 100, rx, Duration::from_secs(5)).await;
        let sent = signals_for(&rec, 100);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Signal::SIGTERM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_gets_sigkill_at_timeout() {
        let rec = Recorder {
            start: Some(Instant::now()),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);

        terminate(&rec, 100, rx, Duration::from_millis(2000)).await;
        let sent = signals_for(&rec, 100);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, Signal::SIGKILL);
        assert!(sent[1].1 >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_reaped_worker_is_not_killed() {
        let rec = Recorder::default();
        let (tx, rx) = watch::channel(true);
        drop(tx);

        terminate(&rec, 100, rx, Duration::from_secs(5)).await;
        assert_eq!(signals_for(&rec, 100).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_that_ignore_sigterm_are_killed_before_timeout() {
        let rec = Recorder {
            children: vec![201, 202],
            fatal: HashMap::from([(201, Signal::SIGTERM), (202, Signal::SIGKILL)]),
            start: Some(Instant::now()),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(false);
        let timeout = Duration::from_millis(2000);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        terminate(&rec, 100, rx, timeout).await;

        assert_eq!(signals_for(&rec, 201).len(), 1);
        let stubborn = signals_for(&rec, 202);
        assert_eq!(stubborn.len(), 2);
        assert_eq!(stubborn[1].0, Signal::SIGKILL);
        assert!(stubborn[1].1 >= timeout - CHILD_POLL_INTERVAL);
        assert!(stubborn[1].1 <= timeout);
    }

    #[tokio::test]
    async fn test_system_signals_reach_own_process() {
        let signals = Arc::new(SystemSignals);
        assert!(signals.kill(std::process::id(), None).is_ok());
    }
}
