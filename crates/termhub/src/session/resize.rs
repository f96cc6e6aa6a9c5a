//! Resize coordination.
//!
//! Resizing makes the shell (or a full-screen program) repaint. While a
//! settle window is active the session's output is dropped as reflow noise;
//! the window restarts on every suppressed resize and ends after a fixed
//! delay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::lock;
use super::output::OutputPipeline;
use super::pty::SessionError;

#[derive(Default)]
struct SettleTimer {
    handle: Option<JoinHandle<()>>,
    epoch: u64,
}

/// Debounces resize-induced output for one session.
pub struct ResizeCoordinator {
    pipeline: Arc<OutputPipeline>,
    settle: Duration,
    runtime: Handle,
    timer: Arc<Mutex<SettleTimer>>,
}

impl ResizeCoordinator {
    /// Creates a coordinator gating `pipeline`.
    pub fn new(pipeline: Arc<OutputPipeline>, settle: Duration, runtime: Handle) -> Self {
        Self {
            pipeline,
            settle,
            runtime,
            timer: Arc::new(Mutex::new(SettleTimer::default())),
        }
    }

    /// Applies a geometry change through `apply`.
    ///
    /// With `suppress`, output is dropped from the moment of the call until
    /// the settle window elapses. Output queued before the call is held back
    /// and delivered after the window. A failing `apply` ends suppression
    /// immediately and is returned to the caller; the session stays usable.
    pub fn resize<F>(&self, cols: u16, rows: u16, suppress: bool, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(u16, u16) -> Result<(), SessionError>,
    {
        if suppress {
            self.pipeline.set_suppressed(true);
            self.cancel();
        }

        if let Err(e) = apply(cols, rows) {
            self.cancel();
            self.pipeline.set_suppressed(false);
            return Err(e);
        }

        if suppress {
            self.schedule_settle();
        }
        Ok(())
    }

    /// Whether a settle window is active.
    pub fn in_progress(&self) -> bool {
        self.pipeline.is_suppressed()
    }

    /// Cancels the settle timer without touching the suppression flag.
    pub fn cancel(&self) {
        let mut timer = lock(&self.timer);
        timer.epoch = timer.epoch.wrapping_add(1);
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    fn schedule_settle(&self) {
        let mut timer = lock(&self.timer);
        timer.epoch = timer.epoch.wrapping_add(1);
        let epoch = timer.epoch;
        if let Some(old) = timer.handle.take() {
            old.abort();
        }

        let shared = Arc::clone(&self.timer);
        let pipeline = Arc::clone(&self.pipeline);
        let settle = self.settle;
        timer.handle = Some(self.runtime.spawn(async move {
            tokio::time::sleep(settle).await;
            let mut timer = lock(&shared);
            if timer.epoch == epoch {
                timer.handle = None;
                pipeline.set_suppressed(false);
                tracing::debug!(session_id = %pipeline.session_id(), "Resize settled");
            }
        }));
    }
}
