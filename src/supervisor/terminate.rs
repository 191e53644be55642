use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// How long to wait for the kernel to reap the child after SIGKILL.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the process group is checked for survivors once the leader exits.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stop `child` and everything in its process group.
///
/// Sends SIGTERM to the group and waits up to `grace` for the leader and any
/// descendants to exit. Whatever is still running at the deadline is
/// SIGKILLed. Returns the leader's exit status if it was reaped.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    // tokio forgets the pid once the child is reaped, so read it first.
    let pid = child.id();
    let deadline = tokio::time::Instant::now() + grace;

    let mut status = match child.try_wait() {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!(error = %e, "try_wait failed before terminate");
            None
        }
    };

    let signalled = signal_group(pid, Signal::Terminate);
    if signalled && status.is_none() {
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(exit)) => {
                tracing::info!(?pid, status = %exit, "watcher exited after SIGTERM");
                status = Some(exit);
            }
            Ok(Err(e)) => tracing::warn!(?pid, error = %e, "error waiting for watcher"),
            Err(_) => tracing::warn!(?pid, ?grace, "watcher did not exit within grace period, killing"),
        }
    }

    if status.is_some() {
        // The leader is gone but descendants (the real CLI behind a package
        // runner) may still hold the group and its pipes.
        while group_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
        if group_alive(pid) {
            tracing::warn!(?pid, "watcher descendants outlived grace period, killing group");
            signal_group(pid, Signal::Kill);
        }
        return status;
    }

    signal_group(pid, Signal::Kill);
    if let Err(e) = child.start_kill() {
        tracing::debug!(?pid, error = %e, "start_kill failed");
    }

    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::error!(?pid, error = %e, "error reaping killed watcher");
            None
        }
        Err(_) => {
            tracing::error!(?pid, "killed watcher was not reaped in time");
            None
        }
    }
}

/// SIGKILLs the child's process group when dropped while armed.
///
/// Covers the supervisor task being aborted mid-run: `kill_on_drop` only
/// reaches the direct child.
pub(crate) struct GroupKillGuard {
    pid: Option<u32>,
}

impl GroupKillGuard {
    pub(crate) fn new(child: &Child) -> Self {
        Self { pid: child.id() }
    }

    /// Call once the leader has been reaped; its pid may be reused after that.
    pub(crate) fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            signal_group(self.pid, Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn group_id(pid: Option<u32>) -> Option<i32> {
    let pid = pid?;
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return None;
    }
    // The child was spawned with process_group(0), so its pid is the pgid.
    Some(pid as i32)
}

/// Signal the process group led by `pid`. Returns false when nothing was sent.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) -> bool {
    let Some(pgid) = group_id(pid) else {
        return false;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc != 0 {
        tracing::debug!(pgid, ?signal, error = %std::io::Error::last_os_error(), "kill(2) failed");
        return false;
    }
    true
}

/// Whether any non-zombie process is left in the group led by `pid`.
///
/// Only meaningful after the leader has been reaped; an unreaped leader
/// always counts.
#[cfg(unix)]
pub(crate) fn group_alive(pid: Option<u32>) -> bool {
    let Some(pgid) = group_id(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    has_running_member(pgid)
}

/// Orphaned descendants are reparented to an init that may never reap them,
/// so zombies are skipped when scanning the group.
#[cfg(target_os = "linux")]
fn has_running_member(pgid: i32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries.flatten().any(|entry| {
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            return false;
        };
        // After the parenthesised command name: state, ppid, pgrp, ...
        let Some((_, rest)) = stat.rsplit_once(')') else {
            return false;
        };
        let mut fields = rest.split_whitespace();
        let state = fields.next();
        let pgrp = fields.nth(1).and_then(|p| p.parse::<i32>().ok());
        state != Some("Z") && pgrp == Some(pgid)
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn has_running_member(_pgid: i32) -> bool {
    true
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) -> bool {
    false
}

#[cfg(not(unix))]
pub(crate) fn group_alive(_pid: Option<u32>) -> bool {
    false
}

/// Exit code as reported to clients. Signal deaths follow the shell
/// convention of 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}
