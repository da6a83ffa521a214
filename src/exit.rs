//! Exit classification: what kind of termination a wait status describes, and
//! whether that termination counts as a crash worth relaunching.
//!
//! Only crashes are ever retried. Anything the caller or the OS induced on
//! purpose (a normal exit code, SIGTERM/SIGKILL, a stop) is final.

use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exit code 0.
    Success,
    /// Non-zero exit code.
    Exited(i32),
    /// Killed by a signal.
    Signaled { signal: i32, core_dumped: bool },
    /// Stopped by a signal (only observable when tracing).
    Stopped(i32),
    /// The platform reported something we can't interpret.
    Unknown,
}

impl Termination {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Termination::Success
        } else if let Some(code) = status.code() {
            Termination::Exited(code)
        } else if let Some(signal) = status.signal() {
            Termination::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            }
        } else if let Some(signal) = status.stopped_signal() {
            Termination::Stopped(signal)
        } else {
            Termination::Unknown
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Success)
    }

    /// The terminating or stopping signal, if any.
    pub fn signal(&self) -> Option<i32> {
        match self {
            Termination::Signaled { signal, .. } | Termination::Stopped(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Conventional shell exit code for this termination (`128 + signal` for
    /// signals).
    pub fn shell_code(&self) -> i32 {
        match self {
            Termination::Success => 0,
            Termination::Exited(code) => *code,
            Termination::Signaled { signal, .. } | Termination::Stopped(signal) => 128 + signal,
            Termination::Unknown => 1,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Success => write!(f, "exit status 0"),
            Termination::Exited(code) => write!(f, "exit status {code}"),
            Termination::Signaled {
                signal,
                core_dumped,
            } => {
                write!(f, "signal: {}", signal_name(*signal))?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            Termination::Stopped(signal) => write!(f, "stopped: {}", signal_name(*signal)),
            Termination::Unknown => write!(f, "unknown termination"),
        }
    }
}

fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signal}"),
    }
}

/// Which terminations count as a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CrashDetection {
    /// Killed by a signal and the wait status reports a core dump.
    #[default]
    CoreDump,
    /// Killed by a fault signal, whether or not a core file was written.
    ///
    /// Use this where `RLIMIT_CORE` is 0 and the kernel never sets the
    /// core-dump bit.
    FaultSignal,
}

impl CrashDetection {
    /// Whether `termination` should trigger a relaunch.
    pub fn is_crash(&self, termination: &Termination) -> bool {
        let Termination::Signaled {
            signal,
            core_dumped,
        } = *termination
        else {
            return false;
        };
        match self {
            CrashDetection::CoreDump => core_dumped,
            CrashDetection::FaultSignal => core_dumped || is_fault_signal(signal),
        }
    }
}

impl std::fmt::Display for CrashDetection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashDetection::CoreDump => write!(f, "core-dump"),
            CrashDetection::FaultSignal => write!(f, "fault-signal"),
        }
    }
}

/// Signals whose default action is "terminate and dump core".
fn is_fault_signal(signal: i32) -> bool {
    use nix::sys::signal::Signal;

    matches!(
        Signal::try_from(signal),
        Ok(Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGABRT
            | Signal::SIGQUIT
            | Signal::SIGSYS
            | Signal::SIGTRAP
            | Signal::SIGXCPU
            | Signal::SIGXFSZ)
    )
}
