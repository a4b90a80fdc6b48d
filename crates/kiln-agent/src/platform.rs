use std::sync::Arc;

use async_trait::async_trait;

/// The only OS process primitives the supervisor needs beyond spawning.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Any probe failure counts as "not alive".
    async fn is_alive(&self, pid: u32) -> bool;
    /// Unconditionally kill `pid` and its descendants. Already-gone is success.
    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()>;
}

/// Picks the implementation for the OS family we were built for.
pub fn platform_control() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(UnixControl)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsControl)
    }
}

#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixControl;

#[cfg(unix)]
fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups, never a single process.
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(unix)]
#[async_trait]
impl ProcessControl for UnixControl {
    async fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = to_pid_t(pid) else {
            return false;
        };
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            // EPERM means "exists but not ours"; treated as dead like every other failure.
            tracing::debug!(pid, error = %err, "liveness probe failed; treating as not alive");
        }
        false
    }

    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        let Some(pid) = to_pid_t(pid) else {
            return Ok(());
        };

        // Workers lead their own session, so pgid == pid.
        if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        let group_err = std::io::Error::last_os_error();
        if group_err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid, error = %group_err, "killpg failed; falling back to single pid");
        }

        if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
}

#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsControl;

/// `tasklist /FO CSV /NH` prints `"image","pid",...` per row, or an INFO line when empty.
#[cfg(any(windows, test))]
pub(crate) fn tasklist_lists_pid(stdout: &str, pid: u32) -> bool {
    let needle = format!("\"{pid}\"");
    stdout
        .lines()
        .any(|line| line.split(',').nth(1).is_some_and(|f| f.trim() == needle))
}

#[cfg(windows)]
#[async_trait]
impl ProcessControl for WindowsControl {
    async fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let out = tokio::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output()
            .await;
        match out {
            Ok(out) if out.status.success() => {
                tasklist_lists_pid(&String::from_utf8_lossy(&out.stdout), pid)
            }
            Ok(out) => {
                tracing::debug!(pid, status = ?out.status, "tasklist failed; treating as not alive");
                false
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "tasklist failed; treating as not alive");
                false
            }
        }
    }

    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        if pid == 0 {
            return Ok(());
        }
        let out = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await?;
        if out.status.success() || !self.is_alive(pid).await {
            return Ok(());
        }
        Err(std::io::Error::other(format!(
            "taskkill failed for pid {pid}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )))
    }
}
