//! Supervise a single external process.
//!
//! [`Supervisor`] launches a child under a shared [`ExecScope`], drains its
//! stdout and stderr concurrently, and relaunches it with a jittered linear
//! backoff when it crashes, up to a fixed retry budget. Deliberate
//! terminations (normal exits, SIGTERM, SIGKILL, stops) are never retried.
//!
//! ```no_run
//! use respawn::{ExecScope, Supervisor};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let scope = ExecScope::with_timeout(Duration::from_secs(100));
//! let mut sup = Supervisor::new(scope, 3, "ls", ["-alh"]);
//! sup.start()?;
//! let output = sup.get_result().await?;
//! print!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("respawn relies on POSIX wait statuses, process groups and signals; only unix targets are supported");

pub mod config;
pub mod drain;
pub mod error;
pub mod exit;
pub mod retry;
pub mod scope;
pub mod signals;
pub mod supervisor;

pub use drain::ProcessOutput;
pub use error::{LaunchError, ResultError, SignalError};
pub use exit::{CrashDetection, Termination};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_LIMIT};
pub use scope::{CancelReason, ExecScope};
pub use supervisor::{Supervisor, SupervisorHandle};

pub use nix::sys::signal::Signal;
