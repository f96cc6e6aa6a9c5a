//! Session registry.
//!
//! The registry is the single source of truth for which sessions exist. It
//! gates creation against the session limit, wires every new session to the
//! shared [`SubscriptionHub`], watches for process exit, and hands
//! termination to the [`TerminationSupervisor`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::cwd::{BoundaryFs, RootBoundary, WorkingDirResolver};
use super::env::EnvPolicy;
use super::hub::{Subscription, SubscriptionHub};
use super::output::{OutputPipeline, PipelineSettings};
use super::pty::{ExitStatus, Session, SessionError, SessionId, SessionState, SpawnRequest};
use super::shell::{ShellResolver, ShellSpec};
use super::supervisor::{default_terminator, ProcessTerminator, TerminationSupervisor};
use crate::config::{Config, SessionConfig, MAX_SESSIONS, MIN_SESSIONS};

/// How often exit watchers poll their child process.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest wait for a session's reader to hit EOF after its process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Polls spent reaping a force-killed process before giving up.
const REAP_ATTEMPTS: usize = 100;

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
/// Operations on unknown sessions report `false`/`None` rather than an
/// error.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a new session.
    async fn create(&self, options: CreateOptions) -> Result<SessionInfo, SessionError>;

    /// Writes data to a session's input.
    fn write(&self, session_id: &str, data: &[u8]) -> bool;

    /// Resizes a session's terminal.
    fn resize(&self, session_id: &str, cols: u16, rows: u16, suppress: bool) -> bool;

    /// Starts terminating a session.
    fn kill(&self, session_id: &str) -> bool;

    /// Gets information about a specific session.
    fn get(&self, session_id: &str) -> Option<SessionInfo>;

    /// Lists all sessions.
    fn list(&self) -> Vec<SessionInfo>;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

/// Parameters of a create request. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Requested working directory.
    pub cwd: Option<String>,
    /// Shell to run instead of the resolved one.
    pub shell: Option<String>,
    /// Arguments for an explicit `shell`.
    pub args: Option<Vec<String>>,
    /// Terminal width in columns.
    pub cols: Option<u16>,
    /// Terminal height in rows.
    pub rows: Option<u16>,
    /// Variables set on top of the filtered ambient environment.
    pub env: Vec<(String, String)>,
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Starting directory.
    pub cwd: PathBuf,
    /// Shell executable.
    pub shell: PathBuf,
    /// Shell arguments.
    pub args: Vec<String>,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Lifecycle state.
    pub state: SessionState,
}

impl SessionInfo {
    fn of(session: &Session) -> Self {
        let (cols, rows) = session.size();
        Self {
            id: session.id().clone(),
            cwd: session.cwd().clone(),
            shell: session.shell().program.clone(),
            args: session.shell().args.clone(),
            created_at: session.created_at(),
            pid: session.pid(),
            cols,
            rows,
            state: session.state(),
        }
    }
}

/// Registry load, for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_session_count: usize,
    pub max_sessions: usize,
    /// `active_session_count / max_sessions`, between 0 and 1 unless the
    /// limit was lowered below the current count.
    pub utilization: f64,
}

/// A reserved session slot, released on drop unless committed.
struct SlotGuard<'a> {
    occupied: &'a AtomicUsize,
    committed: bool,
}

impl SlotGuard<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.occupied.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct RegistryInner {
    settings: SessionConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Registered sessions plus spawns in flight. Never exceeds the limit
    /// at the moment a slot is reserved.
    occupied: AtomicUsize,
    max_sessions: AtomicUsize,
    hub: SubscriptionHub,
    shells: ShellResolver,
    workdirs: WorkingDirResolver,
    env_policy: EnvPolicy,
    supervisor: TerminationSupervisor,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl RegistryInner {
    fn reserve_slot(&self) -> Result<SlotGuard<'_>, SessionError> {
        let max = self.max_sessions.load(Ordering::SeqCst);
        self.occupied
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|current| SessionError::LimitExceeded { current, max })?;
        Ok(SlotGuard {
            occupied: &self.occupied,
            committed: false,
        })
    }

    pub(crate) fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Removes a session and announces its exit. Only the first call for a
    /// given session has any effect.
    pub(crate) fn finalize(&self, session_id: &str, status: ExitStatus) {
        let Some((id, session)) = self.sessions.remove(session_id) else {
            return;
        };
        self.occupied.fetch_sub(1, Ordering::SeqCst);
        session.close();
        if !matches!(session.try_wait(), Ok(Some(_))) {
            self.reap(Arc::clone(&session));
        }

        tracing::info!(
            session_id = %id,
            exit_code = status.exit_code,
            signal = ?status.signal,
            forced = status.forced,
            "Session exited"
        );
        self.hub.emit_exit(&id, &status);
    }

    /// Waits for a killed process so it does not linger as a zombie.
    fn reap(&self, session: Arc<Session>) {
        self.runtime.spawn(async move {
            for _ in 0..REAP_ATTEMPTS {
                match session.try_wait() {
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    _ => return,
                }
            }
            tracing::warn!(
                session_id = %session.id(),
                pid = ?session.pid(),
                "Process still running after forced kill"
            );
        });
    }

    fn watch_exit(self: &Arc<Self>, session: &Arc<Session>) {
        let weak = Arc::downgrade(self);
        let session = Arc::clone(session);
        let cancelled = self.shutdown.child_token();

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let Some(registry) = weak.upgrade() else {
                    return;
                };
                if !registry.is_registered(session.id()) {
                    return;
                }

                let status = match session.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => status,
                    Err(e) => {
                        tracing::warn!(session_id = %session.id(), error = %e, "Failed to poll session process");
                        ExitStatus::exited(1)
                    }
                };

                if session.state() == SessionState::Killing {
                    registry.finalize(session.id(), status);
                    return;
                }

                // Output still in the PTY buffer must reach subscribers
                // before the exit event.
                drop(registry);
                if !session.wait_reader_done(READER_DRAIN_TIMEOUT).await {
                    tracing::debug!(session_id = %session.id(), "PTY reader still open after exit");
                }
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                if !registry.is_registered(session.id()) {
                    return;
                }
                if session.state() != SessionState::Killing {
                    session.output().drain_now();
                }
                registry.finalize(session.id(), status);
                return;
            }
        });
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for entry in self.sessions.iter() {
            self.supervisor.abandon(entry.value());
        }
    }
}

/// Owns every session of one deployment.
///
/// Cheap to clone; clones share the same sessions. Dropping the last clone
/// kills whatever is still running.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Creates a registry from `config` with the local filesystem boundary
    /// and the platform's default terminator.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: &Config) -> Self {
        let boundary = Arc::new(RootBoundary::new(config.workspace.allowed_roots.clone()));
        Self::with_collaborators(config, boundary, default_terminator())
    }

    /// Creates a registry with explicit boundary and termination
    /// collaborators.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_collaborators(
        config: &Config,
        boundary: Arc<dyn BoundaryFs>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        let runtime = Handle::current();
        let settings = config.session.clone();
        let max_sessions = settings.max_sessions.clamp(MIN_SESSIONS, MAX_SESSIONS);
        let supervisor = TerminationSupervisor::new(terminator, settings.kill_grace(), runtime.clone());

        tracing::debug!(max_sessions, "Session registry initialized");

        Self {
            inner: Arc::new(RegistryInner {
                shells: ShellResolver::from_env(settings.default_shell.as_deref()),
                workdirs: WorkingDirResolver::with_home_dir(boundary),
                env_policy: EnvPolicy::from_config(&config.environment),
                settings,
                sessions: DashMap::new(),
                occupied: AtomicUsize::new(0),
                max_sessions: AtomicUsize::new(max_sessions),
                hub: SubscriptionHub::new(),
                supervisor,
                runtime,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Current session limit.
    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions.load(Ordering::SeqCst)
    }

    /// Changes the session limit. Values outside the admissible range are
    /// ignored. Lowering the limit below the current count never affects
    /// running sessions; it only blocks creates until enough have exited.
    pub fn set_max_sessions(&self, max: usize) {
        if !(MIN_SESSIONS..=MAX_SESSIONS).contains(&max) {
            tracing::warn!(
                requested = max,
                min = MIN_SESSIONS,
                max = MAX_SESSIONS,
                "Ignoring out-of-range session limit"
            );
            return;
        }
        let previous = self.inner.max_sessions.swap(max, Ordering::SeqCst);
        tracing::info!(previous, max, "Session limit changed");
    }

    /// Reports current load.
    pub fn health(&self) -> HealthReport {
        let active_session_count = self.count();
        let max_sessions = self.max_sessions();
        HealthReport {
            active_session_count,
            max_sessions,
            utilization: active_session_count as f64 / max_sessions as f64,
        }
    }

    /// Returns the scrollback of a session and drops its undelivered output.
    pub fn take_scrollback_for_reconnect(&self, session_id: &str) -> Option<Vec<u8>> {
        let session = self.inner.session(session_id)?;
        let snapshot = session.output().take_scrollback_for_reconnect();
        tracing::debug!(session_id = %session_id, bytes = snapshot.len(), "Scrollback taken for reconnect");
        Some(snapshot)
    }

    /// Registers a callback for output batches of every session.
    pub fn on_data<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.inner.hub.on_data(callback)
    }

    /// Registers a callback for session exits.
    pub fn on_exit<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &ExitStatus) + Send + Sync + 'static,
    {
        self.inner.hub.on_exit(callback)
    }

    /// The shared subscription hub.
    pub fn hub(&self) -> &SubscriptionHub {
        &self.inner.hub
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Force-kills every session and stops all watchers. Safe to call more
    /// than once and while sessions are already terminating.
    pub fn shutdown(&self) {
        let first = !self.inner.shutdown.is_cancelled();
        self.inner.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &sessions {
            session.begin_killing();
            session.cancel_timers();
            self.inner.supervisor.force(&self.inner, session);
        }

        if first || !sessions.is_empty() {
            tracing::info!(killed = sessions.len(), "Session registry shut down");
        }
    }

    fn resolve_shell(&self, options: &CreateOptions) -> ShellSpec {
        match &options.shell {
            Some(shell) => ShellSpec::explicit(shell, options.args.clone()),
            None => self.inner.shells.resolve(),
        }
    }
}

impl SessionManager for SessionRegistry {
    async fn create(&self, options: CreateOptions) -> Result<SessionInfo, SessionError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SessionError::RegistryClosed);
        }

        let slot = inner.reserve_slot().inspect_err(|e| {
            tracing::warn!(error = %e, "Session creation refused");
        })?;

        let shell = self.resolve_shell(&options);
        let cwd = inner.workdirs.resolve(options.cwd.as_deref());
        let env = inner.env_policy.build(std::env::vars(), &options.env);
        let id = uuid::Uuid::new_v4().to_string();
        let cols = options.cols.unwrap_or(inner.settings.cols);
        let rows = options.rows.unwrap_or(inner.settings.rows);

        let request = SpawnRequest {
            id: id.clone(),
            shell,
            cwd,
            env,
            cols,
            rows,
        };
        let output = OutputPipeline::new(
            id.clone(),
            PipelineSettings::from(&inner.settings),
            inner.hub.clone(),
            inner.runtime.clone(),
        );
        let settle = inner.settings.resize_settle();
        let runtime = inner.runtime.clone();

        let spawned = tokio::task::spawn_blocking(move || Session::spawn(request, output, settle, runtime))
            .await
            .map_err(|e| SessionError::SpawnFailed {
                reason: e.to_string(),
                current: 0,
                max: 0,
            })
            .and_then(|result| result);

        let (session, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = match e {
                    SessionError::SpawnFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                let err = SessionError::SpawnFailed {
                    reason,
                    current: self.count(),
                    max: self.max_sessions(),
                };
                tracing::error!(session_id = %id, error = %err, "Failed to spawn session");
                return Err(err);
            }
        };

        let session = Arc::new(session);
        inner.sessions.insert(id.clone(), Arc::clone(&session));
        slot.commit();
        session.mark_active();
        session.start_read_loop(reader);
        inner.watch_exit(&session);

        let info = SessionInfo::of(&session);
        tracing::info!(
            session_id = %id,
            pid = ?info.pid,
            shell = %info.shell.display(),
            cwd = %info.cwd.display(),
            cols = cols,
            rows = rows,
            "Created new session"
        );

        if inner.shutdown.is_cancelled() {
            session.begin_killing();
            inner.supervisor.force(inner, &session);
            return Err(SessionError::RegistryClosed);
        }

        Ok(info)
    }

    fn write(&self, session_id: &str, data: &[u8]) -> bool {
        let Some(session) = self.inner.session(session_id) else {
            return false;
        };
        if let Err(e) = session.write(data) {
            tracing::warn!(session_id = %session_id, error = %e, "Write to session failed");
        }
        true
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16, suppress: bool) -> bool {
        let Some(session) = self.inner.session(session_id) else {
            return false;
        };
        match session.resize(cols, rows, suppress) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id = %session_id, cols, rows, error = %e, "Resize failed");
                false
            }
        }
    }

    fn kill(&self, session_id: &str) -> bool {
        let Some(session) = self.inner.session(session_id) else {
            return false;
        };
        self.inner.supervisor.kill(&self.inner, &session);
        true
    }

    fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.session(session_id).map(|s| SessionInfo::of(&s))
    }

    fn list(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .iter()
            .map(|entry| SessionInfo::of(entry.value()))
            .collect()
    }

    fn count(&self) -> usize {
        self.inner.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_sessions: usize) -> SessionRegistry {
        let mut config = Config::default();
        config.session.max_sessions = max_sessions;
        config.session.kill_grace_ms = 200;
        SessionRegistry::new(&config)
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let registry = registry(4);

        assert!(!registry.write("missing", b"ls\n"));
        assert!(!registry.resize("missing", 80, 24, true));
        assert!(!registry.kill("missing"));
        assert!(registry.get("missing").is_none());
        assert!(registry.take_scrollback_for_reconnect("missing").is_none());
        assert!(registry.list().is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_set_max_sessions_bounds() {
        let registry = registry(10);

        registry.set_max_sessions(0);
        assert_eq!(registry.max_sessions(), 10);

        registry.set_max_sessions(1001);
        assert_eq!(registry.max_sessions(), 10);

        registry.set_max_sessions(1);
        assert_eq!(registry.max_sessions(), 1);

        registry.set_max_sessions(1000);
        assert_eq!(registry.max_sessions(), 1000);
    }

    #[tokio::test]
    async fn test_configured_limit_is_clamped() {
        assert_eq!(registry(0).max_sessions(), 1);
        assert_eq!(registry(5000).max_sessions(), 1000);
    }

    #[tokio::test]
    async fn test_health_report() {
        let registry = registry(4);
        let health = registry.health();

        assert_eq!(health.active_session_count, 0);
        assert_eq!(health.max_sessions, 4);
        assert_eq!(health.utilization, 0.0);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["activeSessionCount"], 0);
        assert_eq!(json["maxSessions"], 4);
    }

    #[tokio::test]
    async fn test_slot_reservation() {
        let registry = registry(1);
        let inner = &registry.inner;

        let slot = inner.reserve_slot().unwrap();
        assert!(matches!(
            inner.reserve_slot(),
            Err(SessionError::LimitExceeded { current: 1, max: 1 })
        ));

        drop(slot);
        let slot = inner.reserve_slot().unwrap();
        slot.commit();
        assert_eq!(inner.occupied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_after_shutdown() {
        let registry = registry(4);
        registry.shutdown();
        registry.shutdown();

        assert!(registry.is_shut_down());
        assert!(matches!(
            registry.create(CreateOptions::default()).await,
            Err(SessionError::RegistryClosed)
        ));
    }

    #[cfg(unix)]
    fn sh() -> CreateOptions {
        CreateOptions {
            shell: Some("/bin/sh".to_string()),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_limit_exceeded_spawns_nothing() {
        let registry = registry(1);

        let first = registry.create(sh()).await.unwrap();
        let err = registry.create(sh()).await.unwrap_err();

        assert!(matches!(err, SessionError::LimitExceeded { current: 1, max: 1 }));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&first.id).map(|s| s.state), Some(SessionState::Active));

        registry.shutdown();
        assert_eq!(registry.count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let registry = registry(1);

        let err = registry
            .create(CreateOptions {
                shell: Some("/nonexistent/termhub-shell".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SpawnFailed { current: 0, max: 1, .. }));
        assert_eq!(registry.count(), 0);

        let info = registry.create(sh()).await.unwrap();
        assert_eq!(info.shell, PathBuf::from("/bin/sh"));
        assert!(info.args.is_empty());
        registry.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_uses_requested_geometry() {
        let registry = registry(2);

        let info = registry
            .create(CreateOptions {
                cols: Some(132),
                rows: Some(43),
                ..sh()
            })
            .await
            .unwrap();
        assert_eq!((info.cols, info.rows), (132, 43));

        assert!(registry.resize(&info.id, 100, 30, false));
        let info = registry.get(&info.id).unwrap();
        assert_eq!((info.cols, info.rows), (100, 30));

        registry.shutdown();
    }
}
