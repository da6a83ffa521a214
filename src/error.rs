use crate::drain::ProcessOutput;
use crate::exit::Termination;
use crate::scope::CancelReason;
use nix::errno::Errno;
use nix::sys::signal::Signal;

/// Errors from launching the child. Never retried.
#[derive(Debug)]
pub enum LaunchError {
    /// The process could not be spawned (not found, permission denied, …).
    Spawn {
        path: String,
        source: std::io::Error,
    },
    /// A piped output stream was not available after spawning.
    Pipe { stream: &'static str },
    /// The scope was already done; nothing was spawned.
    Cancelled { reason: CancelReason },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { path, source } => {
                write!(f, "failed to start {path}: {source}")
            }
            LaunchError::Pipe { stream } => {
                write!(f, "failed to open {stream} pipe for child process")
            }
            LaunchError::Cancelled { reason } => {
                write!(f, "launch aborted: {reason}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Pipe { .. } | LaunchError::Cancelled { .. } => None,
        }
    }
}

/// Errors from collecting a launch's result.
///
/// Every variant carries the output accumulated by the last launch.
#[derive(Debug)]
pub enum ResultError {
    /// Non-crash abnormal termination: non-zero exit code, non-fault signal, stop.
    Exited {
        termination: Termination,
        output: ProcessOutput,
    },
    /// The process crashed and the retry budget is used up.
    Crashed {
        termination: Termination,
        retries: u32,
        output: ProcessOutput,
    },
    /// The shared scope was cancelled or hit its deadline.
    Cancelled {
        reason: CancelReason,
        output: ProcessOutput,
    },
    /// Launching failed: a relaunch after a crash, or the initial launch in
    /// `Supervisor::run`.
    Launch {
        source: LaunchError,
        output: ProcessOutput,
    },
    /// Waiting on the child failed at the OS level.
    Wait {
        source: std::io::Error,
        output: ProcessOutput,
    },
}

impl ResultError {
    pub fn output(&self) -> &ProcessOutput {
        match self {
            ResultError::Exited { output, .. }
            | ResultError::Crashed { output, .. }
            | ResultError::Cancelled { output, .. }
            | ResultError::Launch { output, .. }
            | ResultError::Wait { output, .. } => output,
        }
    }

    pub fn into_output(self) -> ProcessOutput {
        match self {
            ResultError::Exited { output, .. }
            | ResultError::Crashed { output, .. }
            | ResultError::Cancelled { output, .. }
            | ResultError::Launch { output, .. }
            | ResultError::Wait { output, .. } => output,
        }
    }

    /// How the last launch terminated, when it ran to termination on its own.
    pub fn termination(&self) -> Option<Termination> {
        match self {
            ResultError::Exited { termination, .. } | ResultError::Crashed { termination, .. } => {
                Some(*termination)
            }
            _ => None,
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, ResultError::Crashed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResultError::Cancelled { .. })
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            ResultError::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultError::Exited { termination, .. } => {
                write!(f, "process exited abnormally: {termination}")
            }
            ResultError::Crashed {
                termination,
                retries,
                ..
            } => {
                write!(
                    f,
                    "process crashed ({termination}) after {retries} relaunch(es)"
                )
            }
            ResultError::Cancelled { reason, .. } => {
                write!(f, "process terminated: {reason}")
            }
            ResultError::Launch { source, .. } => {
                write!(f, "failed to launch process: {source}")
            }
            ResultError::Wait { source, .. } => {
                write!(f, "failed to wait for process: {source}")
            }
        }
    }
}

impl std::error::Error for ResultError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResultError::Launch { source, .. } => Some(source),
            ResultError::Wait { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure to deliver a signal to the live child.
#[derive(Debug)]
pub struct SignalError {
    pub pid: i32,
    pub signal: Signal,
    pub source: Errno,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send {} to pid {}: {}",
            self.signal, self.pid, self.source
        )
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> ProcessOutput {
        ProcessOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
        }
    }

    #[test]
    fn test_launch_error_display() {
        let err = LaunchError::Spawn {
            path: "nonexistent-binary-xyz".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("failed to start nonexistent-binary-xyz"));
        assert!(std::error::Error::source(&err).is_some());

        let err = LaunchError::Cancelled {
            reason: CancelReason::DeadlineExceeded,
        };
        assert_eq!(err.to_string(), "launch aborted: deadline exceeded");
    }

    #[test]
    fn test_result_error_carries_output() {
        let err = ResultError::Exited {
            termination: Termination::Exited(2),
            output: output(),
        };
        assert_eq!(err.output().stdout, "out\n");
        assert_eq!(err.termination(), Some(Termination::Exited(2)));
        assert!(!err.is_crash());
        assert!(!err.is_cancelled());
        assert_eq!(err.into_output().stderr, "err\n");
    }

    #[test]
    fn test_cancelled_is_distinct_from_crash() {
        let err = ResultError::Cancelled {
            reason: CancelReason::Cancelled,
            output: ProcessOutput::default(),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_crash());
        assert_eq!(err.cancel_reason(), Some(CancelReason::Cancelled));
        assert_eq!(err.termination(), None);
    }

    #[test]
    fn test_crashed_display_mentions_retries() {
        let err = ResultError::Crashed {
            termination: Termination::Signaled {
                signal: 11,
                core_dumped: true,
            },
            retries: 2,
            output: ProcessOutput::default(),
        };
        assert!(err.is_crash());
        assert!(err.to_string().contains("after 2 relaunch(es)"));
    }

    #[test]
    fn test_signal_error_display() {
        let err = SignalError {
            pid: 4242,
            signal: Signal::SIGTERM,
            source: Errno::ESRCH,
        };
        let msg = err.to_string();
        assert!(msg.contains("SIGTERM"));
        assert!(msg.contains("4242"));
    }
}
