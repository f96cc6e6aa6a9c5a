//! PTY session.
//!
//! A session owns one shell process attached to a pseudo-terminal. Output is
//! read on a dedicated thread and pushed into the session's
//! [`OutputPipeline`]; input, resize and termination go through the methods
//! below.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lock;
use super::output::OutputPipeline;
use super::resize::ResizeCoordinator;
use super::shell::ShellSpec;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Admission control refused the request; no process was spawned.
    #[error("session limit reached ({current}/{max})")]
    LimitExceeded { current: usize, max: usize },

    /// The OS failed to start the process.
    #[error("failed to spawn PTY: {reason} ({current}/{max} sessions)")]
    SpawnFailed {
        reason: String,
        current: usize,
        max: usize,
    },

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The registry has been shut down.
    #[error("session registry is shut down")]
    RegistryClosed,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Process spawned, not yet registered.
    Creating,
    /// Registered and running.
    Active,
    /// Termination requested, waiting for the process to go away.
    Killing,
    /// Process gone, session removed from the registry.
    Exited,
}

/// How a session's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    /// Exit code reported by the OS.
    pub exit_code: u32,
    /// Signal used to end the process, if termination was forced.
    pub signal: Option<String>,
    /// Whether the process was force-killed.
    pub forced: bool,
}

impl ExitStatus {
    /// A process that exited on its own with `code`.
    pub fn exited(code: u32) -> Self {
        Self {
            exit_code: code,
            signal: None,
            forced: false,
        }
    }

    /// A process removed by a forced kill.
    pub fn forced_kill() -> Self {
        Self {
            exit_code: 1,
            signal: cfg!(unix).then(|| "SIGKILL".to_string()),
            forced: true,
        }
    }

    /// Marks an observed status as the result of a forced kill.
    pub fn into_forced(self) -> Self {
        Self {
            signal: self.signal.or_else(|| cfg!(unix).then(|| "SIGKILL".to_string())),
            forced: true,
            ..self
        }
    }
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self::exited(status.exit_code())
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Everything needed to start a session's process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Identifier assigned by the registry.
    pub id: SessionId,
    /// Shell to start.
    pub shell: ShellSpec,
    /// Starting directory.
    pub cwd: PathBuf,
    /// Complete environment of the child.
    pub env: BTreeMap<String, String>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

/// A PTY session with a shell process.
pub struct Session {
    id: SessionId,
    shell: ShellSpec,
    cwd: PathBuf,
    created_at: u64,
    pid: Option<u32>,
    size: Mutex<(u16, u16)>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output: Arc<OutputPipeline>,
    resize: ResizeCoordinator,
    state: Mutex<SessionState>,
    kill_timer: Mutex<Option<JoinHandle<()>>>,
    reader_done: CancellationToken,
}

impl Session {
    /// Spawns the shell described by `request` on a fresh PTY.
    ///
    /// Returns the session in the `Creating` state together with the PTY
    /// reader to hand to [`start_read_loop`](Self::start_read_loop).
    pub fn spawn(
        request: SpawnRequest,
        output: Arc<OutputPipeline>,
        resize_settle: Duration,
        runtime: Handle,
    ) -> Result<(Self, Box<dyn Read + Send>), SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_error)?;

        let mut cmd = CommandBuilder::new(&request.shell.program);
        cmd.args(&request.shell.args);
        cmd.cwd(&request.cwd);
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(spawn_error)?;
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair.master.try_clone_reader().map_err(spawn_error)?;
        let writer = pair.master.take_writer().map_err(spawn_error)?;

        let resize = ResizeCoordinator::new(Arc::clone(&output), resize_settle, runtime);

        let session = Session {
            id: request.id,
            shell: request.shell,
            cwd: request.cwd,
            created_at: now_millis(),
            pid,
            size: Mutex::new((request.cols, request.rows)),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            output,
            resize,
            state: Mutex::new(SessionState::Creating),
            kill_timer: Mutex::new(None),
            reader_done: CancellationToken::new(),
        };

        Ok((session, reader))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the shell this session runs.
    pub fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    /// Returns the starting directory.
    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    /// Creation time in Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Returns the output pipeline.
    pub fn output(&self) -> &Arc<OutputPipeline> {
        &self.output
    }

    pub(crate) fn mark_active(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Creating {
            *state = SessionState::Active;
        }
    }

    /// Moves an active session to `Killing`. Returns false if termination
    /// is already under way.
    pub(crate) fn begin_killing(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Creating | SessionState::Active => {
                *state = SessionState::Killing;
                true
            }
            SessionState::Killing | SessionState::Exited => false,
        }
    }

    /// Writes data to the PTY (stdin).
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut writer = lock(&self.writer);
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Resizes the PTY, optionally suppressing the repaint burst.
    pub fn resize(&self, cols: u16, rows: u16, suppress: bool) -> Result<(), SessionError> {
        self.resize.resize(cols, rows, suppress, |cols, rows| {
            lock(&self.master)
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
            *lock(&self.size) = (cols, rows);
            Ok(())
        })?;

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            suppress = suppress,
            "Resized PTY"
        );
        Ok(())
    }

    /// Whether a resize settle window is active.
    pub fn resize_in_progress(&self) -> bool {
        self.resize.in_progress()
    }

    /// Starts the thread that copies PTY output into the pipeline.
    ///
    /// The thread ends when the PTY reports EOF or an error, which happens
    /// once every holder of the slave side has exited.
    pub(crate) fn start_read_loop(&self, mut reader: Box<dyn Read + Send>) {
        let output = Arc::clone(&self.output);
        let session_id = self.id.clone();
        let done = self.reader_done.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", &session_id[..8.min(session_id.len())]))
            .spawn(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::debug!(session_id = %session_id, "PTY EOF");
                            break;
                        }
                        Ok(n) => {
                            output.ingest(&buffer[..n]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::debug!(
                                session_id = %session_id,
                                error = %e,
                                "PTY read ended"
                            );
                            break;
                        }
                    }
                }
                done.cancel();
            });

        if let Err(e) = spawned {
            tracing::error!(session_id = %self.id, error = %e, "Failed to start PTY reader");
            self.reader_done.cancel();
        }
    }

    /// Waits up to `timeout` for the reader thread to reach EOF. Returns
    /// false on timeout.
    pub(crate) async fn wait_reader_done(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.reader_done.cancelled())
            .await
            .is_ok()
    }

    /// Checks if the child process has exited, without blocking.
    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        Ok(lock(&self.child).try_wait()?.map(ExitStatus::from))
    }

    /// Kills the child through the PTY layer.
    pub(crate) fn kill_process(&self) -> std::io::Result<()> {
        lock(&self.child).kill()
    }

    pub(crate) fn set_kill_timer(&self, handle: JoinHandle<()>) {
        if let Some(old) = lock(&self.kill_timer).replace(handle) {
            old.abort();
        }
    }

    /// Cancels the flush and settle timers.
    pub(crate) fn cancel_timers(&self) {
        self.output.cancel_flush();
        self.resize.cancel();
    }

    /// Final teardown once the session has left the registry.
    pub(crate) fn close(&self) {
        *lock(&self.state) = SessionState::Exited;
        self.output.close();
        self.resize.cancel();
        if let Some(timer) = lock(&self.kill_timer).take() {
            timer.abort();
        }
    }
}

/// Spawn failure without registry counts; the registry fills those in.
fn spawn_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::SpawnFailed {
        reason: e.to_string(),
        current: 0,
        max: 0,
    }
}

/// Returns the current Unix timestamp in milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
