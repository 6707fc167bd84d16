//! Child process termination utilities.
//!
//! Provides liveness checks and the signal escalation used to stop the
//! proxy: SIGTERM, a bounded wait, then SIGKILL, and always a final reap.

use std::io;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use crate::defaults;

/// Check if a process is still alive.
///
/// A zombie that has not been reaped yet still counts as alive.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // Signal 0 doesn't send a signal but checks if the process exists
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // ESRCH means process doesn't exist
        // EPERM means it exists but we don't have permission
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        true // Non-Unix: can't check liveness, assume running
    }
}

/// Ask a child to exit. Returns false when no graceful signal exists on
/// this platform or the signal could not be delivered.
#[cfg(unix)]
pub fn request_terminate(child: &Child) -> bool {
    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn request_terminate(_child: &Child) -> bool {
    false
}

/// Wait up to `timeout` for a child to exit, reaping it if it does.
pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Stop a child process and reap it.
///
/// Sends SIGTERM, waits `grace`, then SIGKILL if necessary. On success the
/// child has exited and been reaped. The error string describes why it
/// could not be killed or reaped.
pub fn stop_child(child: &mut Child, grace: Duration) -> Result<ExitStatus, String> {
    let pid = child.id();

    match child.try_wait() {
        Ok(Some(status)) => return Ok(status),
        Ok(None) => {}
        Err(e) => log::debug!("try_wait on pid {} failed: {}", pid, e),
    }

    if request_terminate(child) {
        match wait_for_exit(child, grace) {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => log::warn!(
                "cloud-sql-proxy (pid {}) did not exit within {:?} of SIGTERM, sending SIGKILL",
                pid,
                grace
            ),
            Err(e) => log::warn!("Waiting on pid {} failed: {}; sending SIGKILL", pid, e),
        }
    }

    if let Err(kill_err) = child.kill() {
        // kill() fails with InvalidInput once the child has already exited
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(status);
        }
        return Err(format!("kill failed: {}", kill_err));
    }

    match wait_for_exit(child, defaults::SHUTDOWN_GRACE) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => Err(format!(
            "process still running {:?} after SIGKILL",
            defaults::SHUTDOWN_GRACE
        )),
        Err(e) => Err(format!("reap failed: {}", e)),
    }
}
