//! Session management module.
//!
//! This module spawns and supervises PTY sessions. Sessions are created
//! through the [`SessionRegistry`], stream their output through a throttled
//! [`OutputPipeline`], and are torn down by the [`TerminationSupervisor`].

pub mod cwd;
pub mod env;
pub mod hub;
pub mod manager;
pub mod output;
pub mod pty;
pub mod resize;
pub mod shell;
pub mod supervisor;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cwd::{BoundaryError, BoundaryFs, RootBoundary, WorkingDirResolver};
pub use env::EnvPolicy;
pub use hub::{Subscription, SubscriptionHub};
pub use manager::{CreateOptions, HealthReport, SessionInfo, SessionManager, SessionRegistry};
pub use output::{OutputPipeline, PipelineSettings, Scrollback};
pub use pty::{ExitStatus, Session, SessionError, SessionId, SessionState};
pub use resize::ResizeCoordinator;
pub use shell::{Platform, ShellResolver, ShellSpec};
pub use supervisor::{default_terminator, ProcessTerminator, TerminationError, TerminationSupervisor};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
