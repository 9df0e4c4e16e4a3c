use kairos_common::{Error, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const GRACE_PERIOD: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);
const STDERR_TAIL_LINES: usize = 20;

/// Owns one child process: drains its output into the log and makes sure
/// it does not outlive us.
pub struct ProcessManager {
    child: Option<Child>,
    name: String,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            child: None,
            name: name.into(),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        }
    }

    /// Spawn `command`, replacing any process started earlier
    pub async fn spawn(&mut self, mut command: Command) -> Result<()> {
        self.cleanup().await?;

        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::ModelLoadFailed(format!("Failed to start {}: {}", self.name, e))
        })?;

        if let Ok(mut tail) = self.stderr_tail.lock() {
            tail.clear();
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, self.name.clone(), "stdout", None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(
                stderr,
                self.name.clone(),
                "stderr",
                Some(self.stderr_tail.clone()),
            ));
        }

        info!(process = %self.name, pid = ?child.id(), "Spawned process");
        self.child = Some(child);
        Ok(())
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(process = %self.name, %status, "Process exited");
                self.child = None;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(process = %self.name, "Error checking process status: {}", e);
                false
            }
        }
    }

    /// Last lines the process wrote to stderr, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    pub async fn terminate(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        info!(process = %self.name, "Terminating process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

                if let Ok(Ok(status)) = timeout(GRACE_PERIOD, child.wait()).await {
                    info!(process = %self.name, %status, "Process exited gracefully");
                    return Ok(());
                }
                warn!(process = %self.name, "No exit after SIGTERM, killing");
            }
        }

        if let Err(e) = child.kill().await {
            warn!(process = %self.name, "Failed to kill: {}", e);
        }

        match timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => debug!(process = %self.name, %status, "Process killed"),
            Ok(Err(e)) => error!(process = %self.name, "Error waiting for exit: {}", e),
            Err(_) => error!(process = %self.name, "Timed out waiting for exit after kill"),
        }

        Ok(())
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if self.is_running() {
            self.terminate().await?;
        }
        self.child = None;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref()?.id()
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // kill_on_drop covers the case where no runtime is left to run this
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let name = self.name.clone();
                handle.spawn(async move {
                    if let Err(e) = child.kill().await {
                        warn!(process = %name, "Failed to kill on drop: {}", e);
                    }
                    let _ = child.wait().await;
                });
            }
        }
    }
}

async fn drain<R>(
    reader: R,
    name: String,
    stream: &'static str,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(process = %name, stream, "{}", line);
        if let Some(tail) = &tail {
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_lifecycle() {
        let mut pm = ProcessManager::new("sleeper");

        let mut cmd = Command::new("sleep");
        cmd.arg("10");

        assert!(pm.spawn(cmd).await.is_ok());
        assert!(pm.is_running());
        assert!(pm.pid().is_some());

        assert!(pm.terminate().await.is_ok());
        assert!(!pm.is_running());
        assert!(pm.pid().is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_load_failure() {
        let mut pm = ProcessManager::new("missing");
        let cmd = Command::new("/nonexistent/kairos-test-binary");

        let result = pm.spawn(cmd).await;
        assert!(matches!(result, Err(Error::ModelLoadFailed(_))));
        assert!(!pm.is_running());
    }

    #[tokio::test]
    async fn test_stderr_tail_is_captured() {
        let mut pm = ProcessManager::new("shell");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo first >&2; echo second >&2");

        pm.spawn(cmd).await.unwrap();

        for _ in 0..50 {
            if pm.stderr_tail().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pm.stderr_tail(), vec!["first".to_string(), "second".to_string()]);
    }
}
