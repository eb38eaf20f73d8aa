//! Process liveness monitoring.
//!
//! Determines whether a pid currently refers to a live process and blocks,
//! via periodic polling, until it no longer does. Polling (rather than an
//! OS wait-for-exit primitive) is deliberate: the watched process is in
//! general not a child of the watcher, so no portable blocking wait applies.

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default delay between successive liveness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The pid denotes a running (not yet reaped) process.
    Alive,
    /// The pid denotes no process: never existed or already exited.
    Exited,
    /// The OS refused to answer (e.g. permission denied). Existence is
    /// unknown; callers should treat this as "still alive" so a premature
    /// notification is never fired.
    Undetermined,
}

/// Outcome of waiting for a process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The first poll on which the process was observed gone.
    ExitObserved {
        /// Wall-clock time spent waiting.
        waited: Duration,
    },
    /// The wait was interrupted before exit was observed.
    Canceled,
}

/// Probe the existence of `pid` without disturbing it.
///
/// On unix this is a signal-0 existence check: no signal is delivered, only
/// permission and existence checking is performed. A nonexistent pid is a
/// normal `Exited` result, never an error.
#[cfg(unix)]
pub fn probe(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        // Out of range for pid_t, cannot name a live process.
        return Liveness::Exited;
    };

    match kill(NixPid::from_raw(raw), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Exited,
        Err(Errno::EPERM) => Liveness::Undetermined,
        Err(errno) => {
            debug!(pid, %errno, "unexpected errno from liveness probe");
            Liveness::Undetermined
        }
    }
}

/// Probe the existence of `pid` via a process-table refresh.
#[cfg(not(unix))]
pub fn probe(pid: u32) -> Liveness {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    if system.process(target).is_some() {
        Liveness::Alive
    } else {
        Liveness::Exited
    }
}

/// Whether `pid` currently denotes a running process.
///
/// An `Undetermined` probe (the OS denied permission to check) is
/// conservatively reported as alive: a wait loop keeps waiting rather than
/// firing a premature notification. If permissions never change this can
/// wait forever; that mirrors the probe's semantics and is intentional.
pub fn is_alive(pid: u32) -> bool {
    match probe(pid) {
        Liveness::Alive => true,
        Liveness::Exited => false,
        Liveness::Undetermined => {
            warn!(pid, "liveness probe undetermined, treating process as still alive");
            true
        }
    }
}

/// Resolve the display name of a running process, if it can be observed.
///
/// Used for startup output only; absence is normal (process gone, or the
/// process table is not readable).
pub fn process_name(pid: u32) -> Option<String> {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .map(|p| p.name().to_string_lossy().into_owned())
}

/// Wait until `pid` exits or the wait is canceled.
///
/// Liveness is checked before the first sleep, so an already-dead pid
/// returns immediately with zero ticks. While the process is alive the loop
/// sleeps `poll_interval` and then invokes `on_tick(elapsed_seconds)` for
/// progress reporting. Cancellation is observed at every poll boundary: the
/// sleep races against `cancel`, so cancellation latency is bounded by one
/// poll interval and a canceled wait returns promptly without a final
/// liveness check.
pub async fn await_exit<F>(
    pid: u32,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut on_tick: F,
) -> WaitOutcome
where
    F: FnMut(u64),
{
    let started = Instant::now();
    loop {
        if !is_alive(pid) {
            return WaitOutcome::ExitObserved {
                waited: started.elapsed(),
            };
        }

        tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Canceled,
            _ = tokio::time::sleep(poll_interval) => {
                on_tick(started.elapsed().as_secs());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert_eq!(probe(std::process::id()), Liveness::Alive);
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_exited() {
        // Far above any realistic pid_max.
        assert_eq!(probe(0x7fff_fff0), Liveness::Exited);
        assert!(!is_alive(0x7fff_fff0));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_exited() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for child");
        assert_eq!(probe(pid), Liveness::Exited);
    }

    #[tokio::test]
    async fn await_exit_returns_immediately_for_dead_pid() {
        let cancel = CancellationToken::new();
        let mut ticks = 0_u32;
        let outcome = await_exit(0x7fff_fff0, Duration::from_millis(10), &cancel, |_| {
            ticks += 1;
        })
        .await;
        assert!(matches!(outcome, WaitOutcome::ExitObserved { .. }));
        assert_eq!(ticks, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn await_exit_observes_child_exit() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.2")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("child pid");
        // Reap the child as soon as it exits so the probe sees it gone.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            await_exit(pid, Duration::from_millis(25), &cancel, |_| {}),
        )
        .await
        .expect("wait should finish well before the timeout");
        assert!(matches!(outcome, WaitOutcome::ExitObserved { .. }));
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_live_process() {
        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        // Our own pid stays alive for the duration of the test.
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            await_exit(std::process::id(), Duration::from_secs(1), &cancel, |_| {}),
        )
        .await
        .expect("cancellation should unwind the wait promptly");
        assert_eq!(outcome, WaitOutcome::Canceled);
    }
}
