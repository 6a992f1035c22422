//! Shell execution feature
//!
//! Runs the command argument through a system interpreter (`sh -c`). The
//! subprocess is placed in its own process group and the whole group is
//! killed when the wall-clock deadline passes, so a command that spawns
//! children cannot outlive its deadline through them.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::{Feature, FeatureError};

/// Interpreter locations probed when the configuration does not name one
const DEFAULT_INTERPRETERS: &[&str] = &["/bin/sh", "/bin/bash", "/usr/bin/sh", "/usr/bin/bash"];

/// Probe string used by the self test
const SELF_TEST_PROBE: &str = "toolhost-shell-probe";

/// Shell execution, trigger `.s`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Shell {
    /// Interpreter binary; autodetected when empty
    #[serde(rename = "InterpreterPath", default)]
    pub interpreter_path: String,
}

#[async_trait]
impl Feature for Shell {
    fn trigger(&self) -> &'static str {
        ".s"
    }

    fn is_configured(&self) -> bool {
        !self.interpreter_path.is_empty()
            || DEFAULT_INTERPRETERS
                .iter()
                .any(|p| std::path::Path::new(p).exists())
    }

    fn initialise(&mut self) -> Result<(), FeatureError> {
        if self.interpreter_path.is_empty() {
            self.interpreter_path = DEFAULT_INTERPRETERS
                .iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(|p| (*p).to_string())
                .ok_or_else(|| FeatureError::Failed("no shell interpreter found".into()))?;
        } else if !std::path::Path::new(&self.interpreter_path).exists() {
            return Err(FeatureError::Failed(format!(
                "interpreter {} does not exist",
                self.interpreter_path
            )));
        }
        debug!(interpreter = %self.interpreter_path, "shell feature initialised");
        Ok(())
    }

    async fn self_test(&self) -> Result<(), FeatureError> {
        let output = self.execute(&format!("echo {SELF_TEST_PROBE}"), 10).await?;
        if output.contains(SELF_TEST_PROBE) {
            Ok(())
        } else {
            Err(FeatureError::Failed(format!(
                "self test expected {SELF_TEST_PROBE:?}, got {output:?}"
            )))
        }
    }

    async fn execute(&self, arg: &str, timeout_sec: u64) -> Result<String, FeatureError> {
        let mut cmd = Command::new(&self.interpreter_path);
        cmd.arg("-c")
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| FeatureError::Failed(format!("failed to spawn interpreter: {e}")))?;
        let pid = child.id();

        let deadline = Duration::from_secs(timeout_sec.max(1));
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                if output.status.success() {
                    Ok(combined)
                } else {
                    Err(FeatureError::Failed(format!(
                        "exit status {}: {}",
                        output.status.code().unwrap_or(-1),
                        combined.trim()
                    )))
                }
            }
            Ok(Err(e)) => Err(FeatureError::Failed(format!("subprocess wait failed: {e}"))),
            Err(_elapsed) => {
                kill_process_group(pid);
                Err(FeatureError::TimedOut)
            }
        }
    }
}

/// Kill the subprocess and everything it spawned.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Ok(pid) = i32::try_from(pid) {
            // The child was made its own group leader at spawn time.
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> Shell {
        let mut shell = Shell {
            interpreter_path: String::new(),
        };
        shell.initialise().unwrap();
        shell
    }

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let out = shell().execute("echo hello", 10).await.unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_captures_stderr() {
        let out = shell().execute("echo oops >&2", 10).await.unwrap();
        assert!(out.contains("oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_with_output() {
        let err = shell().execute("echo bad; exit 3", 10).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit status 3"), "{msg}");
        assert!(msg.contains("bad"), "{msg}");
    }

    #[tokio::test]
    async fn test_deadline_kills_subprocess() {
        let started = std::time::Instant::now();
        let err = shell().execute("sleep 30", 1).await.unwrap_err();
        assert!(matches!(err, FeatureError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_self_test_round_trip() {
        assert!(shell().self_test().await.is_ok());
    }

    #[test]
    fn test_initialise_rejects_missing_interpreter() {
        let mut shell = Shell {
            interpreter_path: "/no/such/shell".into(),
        };
        assert!(shell.initialise().is_err());
    }
}
