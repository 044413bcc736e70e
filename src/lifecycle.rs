//! Tracer process lifecycle
//!
//! The harness owns exactly one child handle per invocation: the tracer. The
//! target is the tracer's own child and shares its process group, so killing
//! the group takes both down.
//!
//! ## Key Features
//!
//! - **TracerProcess**: RAII handle that kills the process group on Drop
//!   unless the tracer was reaped (covers error returns and panics)
//! - **join**: blocking wait with an optional deadline; on expiry the group
//!   is killed, reaped, and the invocation fails with `Timeout`
//! - **Bounded reap**: after a kill the harness waits at most `REAP_GRACE`.
//!   A tracer started through `sudo` is root-owned, so `killpg` gets EPERM;
//!   the kill is then retried through the same privilege prefix
//! - **Reaped**: proof token that the tracer has terminated; required to
//!   read the capture sink

use crate::error::{HarnessError, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Evidence that the tracer process has exited and was waited for
#[derive(Debug)]
pub struct Reaped {
    status: ExitStatus,
    elapsed: Duration,
}

impl Reaped {
    /// Exit status of the tracer itself (not of the target)
    pub fn status(&self) -> ExitStatus {
        self.status
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            status: ExitStatus::from_raw(0),
            elapsed: Duration::ZERO,
        }
    }
}

/// How long to wait for a killed process group to be reaped
pub const REAP_GRACE: Duration = Duration::from_secs(5);

/// A running tracer, leader of its own process group
pub struct TracerProcess {
    child: Option<Child>,
    pid: u32,
    started: Instant,
    kill_prefix: Vec<String>,
}

impl TracerProcess {
    /// Spawn `command` as the leader of a new process group.
    pub fn spawn(mut command: Command) -> Result<Self> {
        command.process_group(0);
        let child = command.spawn().map_err(HarnessError::io("spawning tracer"))?;
        let pid = child.id();
        info!(pid, "tracer spawned");
        Ok(Self {
            child: Some(child),
            pid,
            started: Instant::now(),
            kill_prefix: Vec::new(),
        })
    }

    /// Privilege prefix the tracer was launched with (`sudo -n`), used to
    /// deliver the kill when the group is not ours to signal
    pub fn with_kill_prefix(mut self, prefix: Vec<String>) -> Self {
        self.kill_prefix = prefix;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the tracer exits, or until `deadline` expires.
    pub fn join(mut self, deadline: Option<Duration>) -> Result<Reaped> {
        let Some(child) = self.child.as_mut() else {
            return Err(HarnessError::io("joining tracer")(std::io::Error::other(
                "tracer already reaped",
            )));
        };

        let status = match deadline {
            Some(limit) => match child
                .wait_timeout(limit)
                .map_err(HarnessError::io("waiting for tracer"))?
            {
                Some(status) => status,
                None => {
                    warn!(pid = self.pid, ?limit, "deadline expired, killing tracer group");
                    kill_group(self.pid, &self.kill_prefix);
                    reap_within(child, self.pid, REAP_GRACE);
                    self.child = None;
                    return Err(HarnessError::Timeout(limit));
                }
            },
            None => child.wait().map_err(HarnessError::io("waiting for tracer"))?,
        };

        self.child = None;
        let elapsed = self.started.elapsed();
        debug!(pid = self.pid, %status, ?elapsed, "tracer reaped");
        Ok(Reaped { status, elapsed })
    }
}

impl Drop for TracerProcess {
    fn drop(&mut self) {
        // Only reached with a live child on early-exit paths
        if let Some(mut child) = self.child.take() {
            kill_group(self.pid, &self.kill_prefix);
            reap_within(&mut child, self.pid, REAP_GRACE);
            debug!(pid = self.pid, "tracer group killed on drop");
        }
    }
}

/// SIGKILL the whole process group led by `pid` (tracer and target)
fn kill_group(pid: u32, kill_prefix: &[String]) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(Errno::EPERM) if !kill_prefix.is_empty() => {
            if !kill_group_escalated(kill_prefix, raw) {
                warn!(pid, "privileged kill of tracer process group failed");
            }
        }
        Err(e) => warn!(pid, error = %e, "failed to kill tracer process group"),
    }
}

/// `<prefix> kill -KILL -- -<pgid>`, itself bounded by `REAP_GRACE`
pub(crate) fn kill_group_escalated(prefix: &[String], pgid: i32) -> bool {
    let Some((program, args)) = prefix.split_first() else {
        return false;
    };
    let spawned = Command::new(program)
        .args(args)
        .args(["kill", "-KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let mut killer = match spawned {
        Ok(killer) => killer,
        Err(e) => {
            warn!(pgid, error = %e, "could not run privileged kill");
            return false;
        }
    };
    match killer.wait_timeout(REAP_GRACE) {
        Ok(Some(status)) => status.success(),
        Ok(None) | Err(_) => {
            let _ = killer.kill();
            let _ = killer.wait();
            false
        }
    }
}

/// Reap a killed child, giving up after `grace` so a surviving group can
/// never block the caller. Returns whether the child was reaped.
fn reap_within(child: &mut Child, pid: u32, grace: Duration) -> bool {
    match child.wait_timeout(grace) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!(pid, ?grace, "tracer survived the group kill, abandoning it");
            false
        }
        Err(e) => {
            warn!(pid, error = %e, "failed to reap tracer");
            false
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
