//! Top-level signal handling for the `respawn` binary.
//!
//! SIGINT and SIGTERM cancel the shared scope, which kills the supervised
//! process group and stops any further relaunch. SIGHUP, SIGUSR1 and SIGUSR2
//! are relayed to the child unchanged.

use crate::scope::ExecScope;
use crate::supervisor::SupervisorHandle;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};

/// Trap signals until `scope` is done.
///
/// Returns `Err` only if signal registration fails.
pub async fn trap_and_relay(scope: ExecScope, handle: SupervisorHandle) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        let relay = tokio::select! {
            _ = scope.done() => return Ok(()),
            _ = sigint.recv() => {
                tracing::warn!("SIGINT received, cancelling");
                scope.cancel();
                return Ok(());
            }
            _ = sigterm.recv() => {
                tracing::warn!("SIGTERM received, cancelling");
                scope.cancel();
                return Ok(());
            }
            _ = sighup.recv() => Signal::SIGHUP,
            _ = sigusr1.recv() => Signal::SIGUSR1,
            _ = sigusr2.recv() => Signal::SIGUSR2,
        };

        if let Err(e) = handle.signal(relay) {
            tracing::warn!(error = %e, "failed to relay signal to child");
        }
    }
}
