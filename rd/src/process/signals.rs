//! Per-pid signal delivery
//!
//! Every helper is best effort: a pid that already exited or that we may not
//! signal is logged and reported as `false`, never as an error.

use tracing::{debug, warn};

/// Action to apply to a single process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcSignal {
    Suspend,
    Resume,
    Terminate,
    Kill,
}

impl std::fmt::Display for ProcSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Terminate => "terminate",
            Self::Kill => "kill",
        };
        write!(f, "{}", name)
    }
}

/// Deliver `signal` to `pid`; `true` when the OS accepted it
#[cfg(unix)]
pub fn send(pid: u32, signal: ProcSignal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        ProcSignal::Suspend => Signal::SIGSTOP,
        ProcSignal::Resume => Signal::SIGCONT,
        ProcSignal::Terminate => Signal::SIGTERM,
        ProcSignal::Kill => Signal::SIGKILL,
    };

    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid, %signal, "send: delivered");
            true
        }
        Err(Errno::ESRCH) => {
            debug!(pid, %signal, "send: process already gone");
            false
        }
        Err(Errno::EPERM) => {
            warn!(pid, %signal, "Access denied signalling process");
            false
        }
        Err(e) => {
            warn!(pid, %signal, error = %e, "Failed to signal process");
            false
        }
    }
}

/// Deliver `signal` to `pid`; suspend/resume are unsupported here
#[cfg(not(unix))]
pub fn send(pid: u32, signal: ProcSignal) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    if matches!(signal, ProcSignal::Suspend | ProcSignal::Resume) {
        warn!(pid, %signal, "Process suspension is not supported on this platform");
        return false;
    }

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, ProcessRefreshKind::new());
    match system.process(target) {
        Some(process) => {
            let delivered = process.kill();
            debug!(pid, %signal, delivered, "send: via sysinfo");
            delivered
        }
        None => {
            debug!(pid, %signal, "send: process already gone");
            false
        }
    }
}

/// Deliver `signal` to each pid in order; returns how many were accepted
pub fn send_all<'a>(pids: impl IntoIterator<Item = &'a u32>, signal: ProcSignal) -> usize {
    pids.into_iter().filter(|&&pid| send(pid, signal)).count()
}

/// Whether a pid exists (signal 0 on unix)
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_exists(pid: u32) -> bool {
    super::tree::ProcessTable::snapshot().contains(pid)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;

    #[test]
    fn test_send_to_missing_pid_is_false() {
        // Far above the default pid_max
        assert!(!send(4_000_000, ProcSignal::Terminate));
        assert!(!pid_exists(4_000_000));
    }

    #[test]
    #[serial]
    fn test_kill_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(pid_exists(pid));

        assert!(send(pid, ProcSignal::Suspend));
        assert!(send(pid, ProcSignal::Resume));
        assert!(send(pid, ProcSignal::Kill));

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_send_all_counts_delivered() {
        let pids = [4_000_001, 4_000_002];
        assert_eq!(send_all(&pids, ProcSignal::Kill), 0);
    }
}
