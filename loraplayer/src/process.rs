//! Supervised child processes (resolver runs and the playback engine).

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, trace, warn};

use crate::errors::StartError;

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Killed by a signal or exited with a non-zero code.
    pub crashed: bool,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            crashed: !status.success(),
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            crashed: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnOptions {
    /// Start the child in its own process group (unix) so the whole tree
    /// can be killed at once.
    pub new_process_group: bool,
}

/// A started child process.
///
/// The child is killed if the handle is dropped while it is still running.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitInfo>,
}

impl ProcessHandle {
    pub fn start(program: &Path, args: &[String]) -> Result<Self, StartError> {
        Self::start_with(program, args, SpawnOptions::default())
    }

    pub fn start_with(
        program: &Path,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Self, StartError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if options.new_process_group {
            command.process_group(0);
        }
        #[cfg(not(unix))]
        let _ = options;

        let child = command.spawn().map_err(|source| StartError {
            program: program.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        debug!(program = %program.display(), pid = ?pid, "Process started");

        Ok(Self {
            child,
            pid,
            exit: None,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Exit record, once the process has been reaped.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Whether the exit has already been observed.
    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(ExitInfo::from_status(status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = ?self.pid, "Unable to query process status: {}", err);
                self.exit = Some(ExitInfo::unknown());
                false
            }
        }
    }

    /// Waits for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> ExitInfo {
        if let Some(exit) = self.exit {
            return exit;
        }
        let exit = match self.child.wait().await {
            Ok(status) => ExitInfo::from_status(status),
            Err(err) => {
                warn!(pid = ?self.pid, "Failed to wait for process: {}", err);
                ExitInfo::unknown()
            }
        };
        self.exit = Some(exit);
        exit
    }

    /// Returns `true` if the process exited within `timeout`.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Asks the process to stop (SIGTERM, or a plain `taskkill` on Windows).
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        let Some(pid) = self.pid else { return };
        debug!(pid, "Terminating process");
        terminate_pid(pid);
    }

    /// Forced kill.
    pub fn kill(&mut self) {
        if !self.is_running() {
            return;
        }
        debug!(pid = ?self.pid, "Killing process");
        if let Err(err) = self.child.start_kill() {
            warn!(pid = ?self.pid, "Failed to kill process: {}", err);
        }
    }

    /// Forwards stdout and stderr lines to the log.
    pub fn forward_output(&mut self, label: &'static str) {
        if let Some(stdout) = self.take_stdout() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "loraplayer::process", process = label, "{}", line);
                }
            });
        }
        if let Some(stderr) = self.take_stderr() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "loraplayer::process", process = label, "{}", line);
                }
            });
        }
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    // SAFETY: plain signal delivery to a pid we spawned.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(windows)]
fn terminate_pid(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        debug!(pid, "taskkill failed: {}", err);
    }
}

/// OS-level forced kill of a process and its descendants.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    warn!(pid, "Force-killing process group");
    // SAFETY: signals only; a negative pid targets the process group the
    // engine was spawned into.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
pub fn kill_process_tree(pid: u32) {
    warn!(pid, "Force-killing process tree");
    let result = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(pid, "taskkill failed: {}", err);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn missing_program_is_a_start_error() {
        let err = ProcessHandle::start(Path::new("/nonexistent/lora-engine"), &[])
            .err()
            .expect("spawn must fail");
        assert_eq!(err.program, PathBuf::from("/nonexistent/lora-engine"));
        assert!(err.to_string().starts_with("failed to start /nonexistent/lora-engine"));
    }

    #[tokio::test]
    async fn clean_and_failed_exits_are_distinguished() {
        let mut ok = ProcessHandle::start(Path::new("/bin/sh"), &sh("exit 0")).unwrap();
        assert_eq!(
            ok.wait().await,
            ExitInfo {
                code: Some(0),
                crashed: false
            }
        );

        let mut failed = ProcessHandle::start(Path::new("/bin/sh"), &sh("exit 3")).unwrap();
        let exit = failed.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(exit.crashed);
        assert!(!failed.is_running());
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_process() {
        let mut handle = ProcessHandle::start(Path::new("/bin/sh"), &sh("exec sleep 30")).unwrap();
        assert!(handle.is_running());
        assert!(!handle.wait_for_exit(Duration::from_millis(50)).await);

        handle.terminate();
        assert!(handle.wait_for_exit(Duration::from_secs(5)).await);
        let exit = handle.exit_info().unwrap();
        assert!(exit.crashed);
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn kill_is_a_noop_after_exit() {
        let mut handle = ProcessHandle::start(Path::new("/bin/sh"), &sh("exit 0")).unwrap();
        handle.wait().await;
        handle.kill();
        handle.terminate();
        assert!(handle.has_exited());
    }
}
