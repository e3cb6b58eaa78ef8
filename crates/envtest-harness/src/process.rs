//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Companion child processes owned by the test environment."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::process::Stdio;
use std::time::Duration;

use envtest_common::ProcessSpec;
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A child process started for the suite.
#[derive(Debug)]
pub struct TrackedProcess {
    name: String,
    pid: u32,
    child: Child,
}

impl TrackedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// How a tracked process ended during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMode {
    /// Had already exited before teardown.
    AlreadyExited,
    /// Exited within the grace period after the stop signal.
    Graceful,
    /// Force-killed once the grace period ran out.
    Killed,
}

/// Child processes that must not outlive the suite.
///
/// Every child is spawned with `kill_on_drop`, so dropping the registry
/// without calling [`ProcessRegistry::kill_and_wait`] still kills them.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Vec<TrackedProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processes.iter().map(TrackedProcess::name)
    }

    /// Start `spec` with `extra_env` layered over its own environment.
    pub fn spawn(
        &mut self,
        spec: &ProcessSpec,
        extra_env: &[(&str, String)],
    ) -> std::io::Result<u32> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in extra_env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("process exited before its pid was read"))?;
        info!(process = %spec.name, pid, command = %spec.command, "process started");
        self.processes.push(TrackedProcess {
            name: spec.name.clone(),
            pid,
            child,
        });
        Ok(pid)
    }

    /// Ask every process to stop, wait up to `grace`, then kill whatever is
    /// left. All processes are handled concurrently. Returns `(name, reason)`
    /// for every process that could not be confirmed dead.
    pub async fn kill_and_wait(&mut self, grace: Duration) -> Vec<(String, String)> {
        let processes = std::mem::take(&mut self.processes);
        let outcomes = join_all(processes.into_iter().map(|process| stop_process(process, grace))).await;
        outcomes
            .into_iter()
            .filter_map(|outcome| outcome.err())
            .collect()
    }
}

async fn stop_process(
    mut process: TrackedProcess,
    grace: Duration,
) -> Result<ExitMode, (String, String)> {
    let name = process.name.clone();
    let failed = |message: String| (name.clone(), message);

    if let Ok(Some(status)) = process.child.try_wait() {
        debug!(process = %process.name, %status, "process already exited");
        return Ok(ExitMode::AlreadyExited);
    }

    request_stop(&mut process);
    let waited = tokio::time::timeout(grace, process.child.wait()).await;
    match waited {
        Ok(Ok(status)) => {
            info!(process = %process.name, pid = process.pid, %status, "process exited");
            Ok(ExitMode::Graceful)
        }
        Ok(Err(err)) => Err(failed(format!("wait failed: {err}"))),
        Err(_) => {
            warn!(process = %process.name, pid = process.pid, grace_ms = grace.as_millis() as u64, "grace period elapsed; killing");
            process
                .child
                .kill()
                .await
                .map_err(|err| failed(format!("kill failed: {err}")))?;
            Ok(ExitMode::Killed)
        }
    }
}

#[cfg(unix)]
fn request_stop(process: &mut TrackedProcess) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(process.pid as i32);
    if let Err(err) = kill(target, Signal::SIGTERM) {
        warn!(process = %process.name, pid = process.pid, error = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_stop(process: &mut TrackedProcess) {
    if let Err(err) = process.child.start_kill() {
        warn!(process = %process.name, pid = process.pid, error = %err, "stop request failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn polite_processes_exit_within_grace() {
        let mut registry = ProcessRegistry::new();
        registry
            .spawn(&ProcessSpec::new("sleeper", "sleep").args(["30"]), &[])
            .unwrap();
        assert_eq!(registry.len(), 1);

        let started = std::time::Instant::now();
        let failures = registry.kill_and_wait(Duration::from_secs(5)).await;
        assert!(failures.is_empty(), "{failures:?}");
        assert!(registry.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stubborn_processes_are_killed_after_grace() {
        let mut registry = ProcessRegistry::new();
        let spec = ProcessSpec::new("stubborn", "sh").args(["-c", "trap '' TERM; exec sleep 30"]);
        registry.spawn(&spec, &[]).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let failures = registry.kill_and_wait(Duration::from_millis(300)).await;
        assert!(failures.is_empty(), "{failures:?}");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
    }

    #[tokio::test]
    async fn spawn_reports_missing_binaries() {
        let mut registry = ProcessRegistry::new();
        let err = registry
            .spawn(&ProcessSpec::new("ghost", "/nonexistent/envtest-binary"), &[])
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(registry.is_empty());
    }
}
