//! Session termination.
//!
//! Killing a session is a two-phase affair on signal-capable hosts: a
//! hang-up first, then a forced kill once the grace period runs out. Console
//! hosts have no graceful phase. Whatever goes wrong on the way, the session
//! always ends up removed from the registry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;

use super::manager::RegistryInner;
use super::pty::{ExitStatus, Session};

/// Errors raised while terminating a process. They are logged, never
/// surfaced to callers.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// The process has no known PID.
    #[error("process id unavailable")]
    NoPid,

    /// Delivering a signal failed.
    #[error("failed to send {signal}: {reason}")]
    Signal { signal: &'static str, reason: String },

    /// The PTY layer failed to kill the process.
    #[error("failed to kill process: {0}")]
    Kill(#[from] std::io::Error),
}

/// Platform capability for ending a session's process.
pub trait ProcessTerminator: Send + Sync {
    /// Whether [`terminate`](Self::terminate) is a polite request that may be
    /// ignored. When false, sessions are force-killed immediately.
    fn supports_graceful(&self) -> bool;

    /// Asks the process to exit.
    fn terminate(&self, session: &Session) -> Result<(), TerminationError>;

    /// Kills the process unconditionally.
    fn force_kill(&self, session: &Session) -> Result<(), TerminationError>;
}

/// Signal-based termination: `SIGHUP`, then `SIGKILL`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalTerminator;

#[cfg(unix)]
impl SignalTerminator {
    fn send(session: &Session, signal: nix::sys::signal::Signal) -> Result<(), TerminationError> {
        use nix::unistd::Pid;

        let pid = session.pid().ok_or(TerminationError::NoPid)?;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
            TerminationError::Signal {
                signal: signal.as_str(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(unix)]
impl ProcessTerminator for SignalTerminator {
    fn supports_graceful(&self) -> bool {
        true
    }

    fn terminate(&self, session: &Session) -> Result<(), TerminationError> {
        Self::send(session, nix::sys::signal::Signal::SIGHUP)
    }

    fn force_kill(&self, session: &Session) -> Result<(), TerminationError> {
        match Self::send(session, nix::sys::signal::Signal::SIGKILL) {
            Err(TerminationError::NoPid) => Ok(session.kill_process()?),
            other => other,
        }
    }
}

/// Handle-based termination for console hosts: one unconditional kill.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleTerminator;

impl ProcessTerminator for ConsoleTerminator {
    fn supports_graceful(&self) -> bool {
        false
    }

    fn terminate(&self, session: &Session) -> Result<(), TerminationError> {
        self.force_kill(session)
    }

    fn force_kill(&self, session: &Session) -> Result<(), TerminationError> {
        Ok(session.kill_process()?)
    }
}

/// Returns the terminator for the host platform.
pub fn default_terminator() -> Arc<dyn ProcessTerminator> {
    #[cfg(unix)]
    {
        Arc::new(SignalTerminator)
    }
    #[cfg(not(unix))]
    {
        Arc::new(ConsoleTerminator)
    }
}

/// Drives sessions from `Active` to `Exited`.
pub struct TerminationSupervisor {
    terminator: Arc<dyn ProcessTerminator>,
    grace: Duration,
    runtime: Handle,
}

impl TerminationSupervisor {
    /// Creates a supervisor using `terminator` with the given grace period.
    pub fn new(terminator: Arc<dyn ProcessTerminator>, grace: Duration, runtime: Handle) -> Self {
        Self {
            terminator,
            grace,
            runtime,
        }
    }

    /// Grace period between the graceful and the forced phase.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Starts terminating `session`. Idempotent: a session already being
    /// killed is left alone.
    pub(crate) fn kill(&self, registry: &Arc<RegistryInner>, session: &Arc<Session>) {
        if !session.begin_killing() {
            tracing::debug!(session_id = %session.id(), "Session already terminating");
            return;
        }
        session.cancel_timers();

        if !self.terminator.supports_graceful() {
            self.force(registry, session);
            return;
        }

        if let Err(e) = self.terminator.terminate(session) {
            tracing::warn!(
                session_id = %session.id(),
                error = %e,
                "Graceful termination failed, waiting for forced kill"
            );
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(registry);
        let target = Arc::clone(session);
        let terminator = Arc::clone(&self.terminator);
        let grace = self.grace;
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(registry) = weak.upgrade() else {
                return;
            };
            if !registry.is_registered(target.id()) {
                return;
            }
            tracing::info!(
                session_id = %target.id(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, forcing kill"
            );
            force_with(terminator.as_ref(), &registry, &target);
        });
        session.set_kill_timer(timer);

        tracing::info!(session_id = %session.id(), pid = ?session.pid(), "Session termination requested");
    }

    /// Kills `session` immediately and removes it from the registry.
    pub(crate) fn force(&self, registry: &RegistryInner, session: &Session) {
        force_with(self.terminator.as_ref(), registry, session);
    }

    /// Kills `session` without touching any registry. Used when the registry
    /// itself is being dropped.
    pub(crate) fn abandon(&self, session: &Session) {
        if let Err(e) = self.terminator.force_kill(session) {
            tracing::warn!(session_id = %session.id(), error = %e, "Forced kill failed");
        }
        session.close();
    }
}

fn force_with(terminator: &dyn ProcessTerminator, registry: &RegistryInner, session: &Session) {
    if let Err(e) = terminator.force_kill(session) {
        tracing::warn!(session_id = %session.id(), error = %e, "Forced kill failed");
    }

    let status = match session.try_wait() {
        Ok(Some(status)) => status.into_forced(),
        _ => ExitStatus::forced_kill(),
    };
    registry.finalize(session.id(), status);
}
