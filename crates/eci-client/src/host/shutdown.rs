//! Graceful shutdown for the host child process with SIGTERM → SIGKILL escalation.

use std::io;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stop `child`, giving it `grace` to exit on its own.
///
/// # Strategy
/// 1. Already exited: reap and return
/// 2. Unix: SIGTERM, then poll for exit until `grace` elapses
/// 3. Still running (or not Unix): kill and reap
pub fn shutdown_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(status) = terminate_unix(child, grace)? {
            return Ok(status);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    debug!(pid = child.id(), "Escalating to forced kill");
    match child.kill() {
        Ok(()) => {}
        // Exited between the last poll and the kill.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait()
}

/// Send SIGTERM and wait up to `grace`. `None` means the child is still
/// running.
#[cfg(unix)]
fn terminate_unix(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    let pid = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().map(Some);
        }
        return Err(io::Error::other(e));
    }

    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    #[cfg(unix)]
    fn sigterm_is_enough_for_a_cooperative_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let started = Instant::now();
        let status = shutdown_child(&mut child, Duration::from_secs(5)).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[cfg(unix)]
    fn stubborn_child_is_killed_after_grace() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .spawn()
            .unwrap();
        // Let the shell install its trap.
        thread::sleep(Duration::from_millis(200));
        let status = shutdown_child(&mut child, Duration::from_millis(200)).unwrap();
        assert!(!status.success());
    }

    #[test]
    #[cfg(unix)]
    fn already_exited_child_is_reaped() {
        let mut child = Command::new("true").spawn().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(shutdown_child(&mut child, Duration::from_secs(1)).unwrap().success());
    }
}
