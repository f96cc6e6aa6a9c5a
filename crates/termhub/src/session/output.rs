//! Session output pipeline.
//!
//! Every chunk read from a PTY lands in two places: a bounded scrollback
//! that remembers the most recent output for reconnecting clients, and a
//! pending queue that a flush timer drains in size-bounded batches to the
//! [`SubscriptionHub`]. Memory use and update rate are therefore bounded
//! independently of how fast the child process writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::hub::SubscriptionHub;
use super::lock;
use super::pty::SessionId;
use crate::config::SessionConfig;

/// Sizing and timing of an [`OutputPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Bytes of history retained.
    pub scrollback_cap: usize,
    /// Largest batch handed to subscribers at once.
    pub batch_size: usize,
    /// Delay before each flush.
    pub throttle: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for PipelineSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            scrollback_cap: config.scrollback_cap,
            batch_size: config.output_batch_size.max(1),
            throttle: config.throttle_interval(),
        }
    }
}

/// Bounded byte history that drops the oldest data first.
#[derive(Debug, Clone)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    cap: usize,
}

impl Scrollback {
    /// Creates an empty scrollback holding at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    /// Appends `data`, then trims from the front down to the cap.
    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        self.buf.extend(data);
        let excess = self.buf.len().saturating_sub(self.cap);
        self.buf.drain(..excess);
    }

    /// Copies the retained history out in order.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Bytes currently retained.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum bytes retained.
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

struct OutputState {
    scrollback: Scrollback,
    pending: VecDeque<u8>,
    flush_timer: Option<JoinHandle<()>>,
    /// Bumped on every schedule and cancel; a timer whose epoch is stale
    /// exits without touching the queue.
    flush_epoch: u64,
    closed: bool,
}

/// Per-session scrollback plus throttled, batched delivery.
pub struct OutputPipeline {
    session_id: SessionId,
    settings: PipelineSettings,
    hub: SubscriptionHub,
    runtime: Handle,
    state: Mutex<OutputState>,
    /// Held while a batch is taken and delivered, so batches reach
    /// subscribers in arrival order.
    delivery: Mutex<()>,
    suppressed: AtomicBool,
}

impl OutputPipeline {
    /// Creates a pipeline whose timers run on `runtime`.
    pub fn new(
        session_id: SessionId,
        settings: PipelineSettings,
        hub: SubscriptionHub,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            settings,
            hub,
            runtime,
            state: Mutex::new(OutputState {
                scrollback: Scrollback::new(settings.scrollback_cap),
                pending: VecDeque::new(),
                flush_timer: None,
                flush_epoch: 0,
                closed: false,
            }),
            delivery: Mutex::new(()),
            suppressed: AtomicBool::new(false),
        })
    }

    /// Session this pipeline belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Accepts a chunk of process output.
    ///
    /// Returns false if the chunk was dropped (resize suppression active,
    /// pipeline closed, or empty chunk).
    pub fn ingest(self: &Arc<Self>, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        if self.is_suppressed() {
            tracing::trace!(
                session_id = %self.session_id,
                bytes = data.len(),
                "Dropping output during resize settle window"
            );
            return false;
        }

        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        state.scrollback.push(data);
        state.pending.extend(data);
        if state.flush_timer.is_none() {
            self.schedule_flush(&mut state);
        }
        true
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut OutputState) {
        state.flush_epoch = state.flush_epoch.wrapping_add(1);
        let epoch = state.flush_epoch;
        let pipeline = Arc::clone(self);
        state.flush_timer = Some(self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(pipeline.settings.throttle).await;
                if !pipeline.flush(epoch) {
                    break;
                }
            }
        }));
    }

    /// Delivers at most one batch. Returns whether another flush is due.
    ///
    /// While suppressed nothing is delivered; queued output waits for the
    /// settle window to end.
    fn flush(&self, epoch: u64) -> bool {
        let _delivery = lock(&self.delivery);
        let (batch, more) = {
            let mut state = lock(&self.state);
            if state.closed || state.flush_epoch != epoch {
                return false;
            }
            if self.is_suppressed() {
                return true;
            }
            let take = state.pending.len().min(self.settings.batch_size);
            let batch: Vec<u8> = state.pending.drain(..take).collect();
            let more = !state.pending.is_empty();
            if !more {
                state.flush_timer = None;
            }
            (batch, more)
        };

        if !batch.is_empty() {
            tracing::trace!(
                session_id = %self.session_id,
                bytes = batch.len(),
                more,
                "Delivering output batch"
            );
            self.hub.emit_data(&self.session_id, &batch);
        }
        more
    }

    /// Cancels a scheduled flush. Pending data stays queued.
    pub fn cancel_flush(&self) {
        let mut state = lock(&self.state);
        Self::cancel_timer(&mut state);
    }

    fn cancel_timer(state: &mut OutputState) {
        state.flush_epoch = state.flush_epoch.wrapping_add(1);
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
    }

    /// Delivers everything still pending right away, in batches.
    pub fn drain_now(&self) {
        let _delivery = lock(&self.delivery);
        let pending: Vec<u8> = {
            let mut state = lock(&self.state);
            Self::cancel_timer(&mut state);
            state.pending.drain(..).collect()
        };
        for batch in pending.chunks(self.settings.batch_size) {
            self.hub.emit_data(&self.session_id, batch);
        }
    }

    /// Returns the scrollback and discards pending, undelivered output.
    ///
    /// A reconnecting client renders the snapshot instead of also receiving
    /// a replay of batches it would see twice.
    pub fn take_scrollback_for_reconnect(&self) -> Vec<u8> {
        let mut state = lock(&self.state);
        let snapshot = state.scrollback.snapshot();
        state.pending.clear();
        Self::cancel_timer(&mut state);
        snapshot
    }

    /// Copies the scrollback without touching pending output.
    pub fn scrollback(&self) -> Vec<u8> {
        lock(&self.state).scrollback.snapshot()
    }

    /// Bytes waiting for delivery.
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Whether a flush timer is scheduled.
    pub fn flush_scheduled(&self) -> bool {
        lock(&self.state).flush_timer.is_some()
    }

    /// Turns resize suppression on or off.
    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
    }

    /// Whether output is currently being dropped as reflow noise.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Stops accepting and delivering output and cancels the flush timer.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.pending.clear();
        Self::cancel_timer(&mut state);
    }
}
