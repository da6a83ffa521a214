//! Process supervisor: launch one child, drain its output, relaunch it when it
//! crashes, and relay signals to it.
//!
//! The child is spawned in its own process group so a cancelled scope can kill
//! the whole group. `stop()`/`signal()` target only the child's pid.

use crate::drain::{drain_lines, ProcessOutput};
use crate::error::{LaunchError, ResultError, SignalError};
use crate::exit::{CrashDetection, Termination};
use crate::retry::{RetryDecision, RetryPolicy, DEFAULT_RETRY_DELAY_MS};
use crate::scope::{CancelReason, ExecScope};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Signal-relay view of the live child, shared with [`SupervisorHandle`]s.
#[derive(Debug, Default)]
struct LiveChild {
    pid: Option<Pid>,
    /// Set once the child has been reaped; its pid may already be reused.
    exited: bool,
}

type SharedChild = Arc<Mutex<LiveChild>>;

/// A started child with its output pipes not yet drained.
struct Running {
    child: Child,
    pid: Pid,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Supervises a single external process.
///
/// Created with a scope, a retry limit, a path and arguments; the scope is
/// fixed for the lifetime of the supervisor and reused for every relaunch.
pub struct Supervisor {
    path: String,
    args: Vec<String>,
    env: Option<Vec<(OsString, OsString)>>,
    scope: ExecScope,
    retry: RetryPolicy,
    crash_detection: CrashDetection,
    running: Option<Running>,
    live: SharedChild,
}

impl Supervisor {
    pub fn new<I, S>(scope: ExecScope, retry_limit: u32, path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: None,
            scope,
            retry: RetryPolicy::new(retry_limit, DEFAULT_RETRY_DELAY_MS),
            crash_detection: CrashDetection::default(),
            running: None,
            live: SharedChild::default(),
        }
    }

    /// Give the child the caller's current environment plus `overrides`.
    ///
    /// The environment is snapshotted now. Call before `start()`.
    pub fn set_env<I, K, V>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut env: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        for (key, value) in overrides {
            let key = key.into();
            env.retain(|(k, _)| *k != key);
            env.push((key, value.into()));
        }
        self.env = Some(env);
    }

    /// Replace the retry limit and backoff base unit. Call before the first
    /// `start()`.
    pub fn set_retry_configs(&mut self, retry_limit: u32, retry_base_delay_ms: u64) {
        self.retry.reconfigure(retry_limit, retry_base_delay_ms);
    }

    /// Replace only the backoff base unit. Call before the first `start()`.
    pub fn set_retry_base_delay_ms(&mut self, retry_base_delay_ms: u64) {
        self.retry.reconfigure(self.retry.limit(), retry_base_delay_ms);
    }

    /// Choose which terminations count as crashes. Call before the first
    /// `start()`.
    pub fn set_crash_detection(&mut self, crash_detection: CrashDetection) {
        self.crash_detection = crash_detection;
    }

    /// Crash-triggered relaunches performed so far.
    pub fn retry_count(&self) -> u32 {
        self.retry.attempts()
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry.limit()
    }

    pub fn retry_base_delay_ms(&self) -> u64 {
        self.retry.base_delay_ms()
    }

    pub fn crash_detection(&self) -> CrashDetection {
        self.crash_detection
    }

    pub fn scope(&self) -> &ExecScope {
        &self.scope
    }

    /// Pid of the most recently started child.
    pub fn pid(&self) -> Option<u32> {
        self.handle().pid()
    }

    /// A cloneable handle for stopping or signalling the child from another
    /// task while `get_result()` is running.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            live: Arc::clone(&self.live),
        }
    }

    /// Spawn the child with piped stdout/stderr.
    ///
    /// Must be called from within a tokio runtime. Replaces (and kills) any
    /// child that is still owned from a previous start.
    pub fn start(&mut self) -> Result<(), LaunchError> {
        if let Some(reason) = self.scope.done_reason() {
            return Err(LaunchError::Cancelled { reason });
        }

        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group so cancellation can kill the whole tree
            .kill_on_drop(true);
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            path: self.path.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::Pipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::Pipe { stream: "stderr" })?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| LaunchError::Spawn {
                path: self.path.clone(),
                source: std::io::Error::other("spawned child has no pid"),
            })?;

        tracing::info!(
            command = %self.path,
            args = ?self.args,
            pid = pid.as_raw(),
            retry = self.retry.attempts(),
            "process started"
        );

        *self.lock_live() = LiveChild {
            pid: Some(pid),
            exited: false,
        };
        self.running = Some(Running {
            child,
            pid,
            stdout,
            stderr,
        });
        Ok(())
    }

    /// Drain the child's output, wait for it, and classify how it ended.
    ///
    /// Crashes within the retry budget are relaunched after a jittered
    /// backoff and the whole cycle repeats; the returned output is that of the
    /// last launch. Returns empty output if there is no started child.
    ///
    /// Drive this to completion. Dropping the future mid-run kills the live
    /// child, and later `stop()`/`signal()` calls report it as gone.
    pub async fn get_result(&mut self) -> Result<ProcessOutput, ResultError> {
        loop {
            let Some(running) = self.running.take() else {
                return Ok(ProcessOutput::default());
            };

            let (output, status) = self.collect(running).await?;
            let status = status.map_err(|source| ResultError::Wait {
                source,
                output: output.clone(),
            })?;

            let termination = Termination::from_status(status);
            tracing::info!(%termination, "process exited");
            if termination.is_success() {
                return Ok(output);
            }

            let crashed = self.crash_detection.is_crash(&termination);
            match self.retry.evaluate(crashed) {
                RetryDecision::Finish => {
                    return Err(ResultError::Exited {
                        termination,
                        output,
                    });
                }
                RetryDecision::Exhausted => {
                    return Err(ResultError::Crashed {
                        termination,
                        retries: self.retry.attempts(),
                        output,
                    });
                }
                RetryDecision::Retry { attempt, delay } => {
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    if let Err(reason) = self.backoff(delay).await {
                        return Err(ResultError::Cancelled { reason, output });
                    }
                    self.relaunch(output)?;
                }
            }
        }
    }

    /// `start()` followed by `get_result()`.
    ///
    /// A failed initial launch is reported as `ResultError::Launch` (or
    /// `Cancelled`) with empty output.
    pub async fn run(&mut self) -> Result<ProcessOutput, ResultError> {
        self.start().map_err(|source| match source {
            LaunchError::Cancelled { reason } => ResultError::Cancelled {
                reason,
                output: ProcessOutput::default(),
            },
            source => ResultError::Launch {
                source,
                output: ProcessOutput::default(),
            },
        })?;
        self.get_result().await
    }

    /// Send SIGTERM to the child so it can shut down cleanly.
    pub fn stop(&self) -> Result<(), SignalError> {
        self.handle().stop()
    }

    /// Forward `sig` to the child.
    pub fn signal(&self, sig: Signal) -> Result<(), SignalError> {
        self.handle().signal(sig)
    }

    /// Start the next attempt after a crash. `output` is the crashed attempt's
    /// and is attached to the error if the launch fails.
    fn relaunch(&mut self, output: ProcessOutput) -> Result<(), ResultError> {
        match self.start() {
            Ok(()) => Ok(()),
            Err(LaunchError::Cancelled { reason }) => {
                Err(ResultError::Cancelled { reason, output })
            }
            Err(source) => Err(ResultError::Launch { source, output }),
        }
    }

    /// Drain both pipes concurrently, join, then wait, racing the whole thing
    /// against the scope.
    async fn collect(
        &self,
        running: Running,
    ) -> Result<(ProcessOutput, std::io::Result<ExitStatus>), ResultError> {
        let Running {
            mut child,
            pid,
            stdout,
            stderr,
        } = running;
        // Runs on every exit path, including this future being dropped mid-await.
        let mut guard = ReapGuard {
            live: &self.live,
            pid,
            finished: false,
        };

        let stdout_task = tokio::spawn(drain_lines(stdout, "stdout"));
        let stderr_task = tokio::spawn(drain_lines(stderr, "stderr"));

        let collected = async {
            let output = join_drains(stdout_task, stderr_task).await;
            let status = child.wait().await;
            (output, status)
        };
        tokio::pin!(collected);

        let result = tokio::select! {
            res = &mut collected => Ok(res),
            reason = self.scope.done() => {
                tracing::warn!(pid = pid.as_raw(), %reason, "scope ended, killing process group");
                kill_group(pid);
                let (output, _) = collected.await;
                Err(ResultError::Cancelled { reason, output })
            }
        };
        guard.finished = true;
        result
    }

    /// Sleep for `delay`, or return early with the reason if the scope ends.
    async fn backoff(&self, delay: Duration) -> Result<(), CancelReason> {
        if let Some(reason) = self.scope.done_reason() {
            return Err(reason);
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            reason = self.scope.done() => Err(reason),
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, LiveChild> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("env_overridden", &self.env.is_some())
            .field("retry", &self.retry)
            .field("crash_detection", &self.crash_detection)
            .field("running", &self.running.is_some())
            .finish()
    }
}

/// Stop/signal access to a supervisor's child, usable from any task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    live: SharedChild,
}

impl SupervisorHandle {
    /// Pid of the most recently started child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.lock_live()
            .pid
            .and_then(|pid| u32::try_from(pid.as_raw()).ok())
    }

    /// Send SIGTERM. A no-op if nothing was ever started.
    pub fn stop(&self) -> Result<(), SignalError> {
        self.signal(Signal::SIGTERM)?;
        if self.lock_live().pid.is_some() {
            tracing::info!("process stopped by caller");
        }
        Ok(())
    }

    /// Forward `sig` to the child. A no-op if nothing was ever started; fails
    /// with `ESRCH` once the child has been reaped.
    pub fn signal(&self, sig: Signal) -> Result<(), SignalError> {
        let live = self.lock_live();
        let Some(pid) = live.pid else {
            return Ok(());
        };
        if live.exited {
            return Err(SignalError {
                pid: pid.as_raw(),
                signal: sig,
                source: Errno::ESRCH,
            });
        }
        tracing::debug!(pid = pid.as_raw(), signal = %sig, "relaying signal");
        signal::kill(pid, sig).map_err(|source| SignalError {
            pid: pid.as_raw(),
            signal: sig,
            source,
        })
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, LiveChild> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the shared child as exited when a collect ends. If the collect was
/// abandoned before the child was reaped, the process group is killed first;
/// `kill_on_drop` and tokio's orphan reaper take care of the child itself.
struct ReapGuard<'a> {
    live: &'a SharedChild,
    pid: Pid,
    finished: bool,
}

impl Drop for ReapGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(pid = self.pid.as_raw(), "result abandoned, killing process group");
            kill_group(self.pid);
        }
        self.live.lock().unwrap_or_else(PoisonError::into_inner).exited = true;
    }
}

async fn join_drains(stdout: JoinHandle<String>, stderr: JoinHandle<String>) -> ProcessOutput {
    let (stdout, stderr) = tokio::join!(stdout, stderr);
    ProcessOutput {
        stdout: stdout.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "stdout drain task failed");
            String::new()
        }),
        stderr: stderr.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "stderr drain task failed");
            String::new()
        }),
    }
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(pid: Pid) {
    if let Err(e) = signal::killpg(pid, Signal::SIGKILL) {
        tracing::debug!(pid = pid.as_raw(), error = %e, "killpg failed, killing child directly");
        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "kill failed");
        }
    }
}
