//! Per-layer liveness detection
//!
//! A `StreamTracker` watches the sequence numbers of one spatial layer and
//! declares it active or stopped. `observe` runs on the packet path and only
//! touches atomics once initialized; a detection task samples the packet
//! count once per cycle.
//!
//! The detection task is cancelled by bumping a generation counter: a task
//! that finds its captured generation stale exits at its next tick, so a
//! stale task can outlive `reset`/`stop` by at most one cycle but never acts.

use crate::config::TrackerThresholds;
use crate::ops_queue::OpsQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Stopped,
    Active,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Receives status transitions, in order, off the detection task.
pub trait StreamStatusListener: Send + Sync {
    fn on_status_changed(&self, status: StreamStatus);
}

struct TrackerState {
    status: StreamStatus,
    cycle_count: u32,
    stopped: bool,
}

pub struct StreamTracker {
    samples_required: u32,
    cycles_required: u32,
    cycle_duration: Duration,

    listener: Arc<dyn StreamStatusListener>,
    ops: OpsQueue,

    paused: AtomicBool,
    initialized: AtomicBool,
    count_since_last: AtomicU32,
    last_sn: AtomicU16,
    generation: AtomicU64,

    state: Mutex<TrackerState>,
    span: Span,
}

impl StreamTracker {
    #[must_use]
    pub fn new(
        thresholds: TrackerThresholds,
        cycle_duration: Duration,
        listener: Arc<dyn StreamStatusListener>,
        span: Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            samples_required: thresholds.samples_required,
            cycles_required: thresholds.cycles_required,
            cycle_duration,
            listener,
            ops: OpsQueue::new("stream tracker", span.clone()),
            paused: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            count_since_last: AtomicU32::new(0),
            last_sn: AtomicU16::new(0),
            generation: AtomicU64::new(0),
            state: Mutex::new(TrackerState {
                status: StreamStatus::Stopped,
                cycle_count: 0,
                stopped: false,
            }),
            span,
        })
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.state.lock().status
    }

    /// Stop detection and callback delivery for good.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.ops.stop();
    }

    /// Forget everything seen so far; the next packet re-arms the tracker.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        self.reset_locked(&mut state);
    }

    fn reset_locked(&self, state: &mut TrackerState) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.initialized.store(false, Ordering::Release);
        self.count_since_last.store(0, Ordering::Relaxed);
        state.cycle_count = 0;
        self.set_status_locked(state, StreamStatus::Stopped);
    }

    /// While paused nothing is counted or detected. The detection task keeps
    /// running, so a layer that stays silent after resuming is declared
    /// stopped at the end of the next cycle.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        self.paused.store(paused, Ordering::Release);
        if !paused {
            // a partial count from before the pause must not carry over
            self.count_since_last.store(0, Ordering::Relaxed);
            state.cycle_count = 0;
        }
    }

    /// Observe a received packet.
    pub fn observe(self: &Arc<Self>, sn: u16) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        if !self.initialized.load(Ordering::Acquire) {
            self.init(sn);
            return;
        }

        // ignore out-of-order sequence numbers
        let last_sn = self.last_sn.load(Ordering::Relaxed);
        if sn.wrapping_sub(last_sn) > 1 << 15 {
            return;
        }
        self.last_sn.store(sn, Ordering::Relaxed);
        self.count_since_last.fetch_add(1, Ordering::Relaxed);
    }

    fn init(self: &Arc<Self>, sn: u16) {
        let generation = {
            let state = self.state.lock();
            if state.stopped || self.initialized.load(Ordering::Acquire) {
                return;
            }
            self.last_sn.store(sn, Ordering::Relaxed);
            self.initialized.store(true, Ordering::Release);
            self.generation.load(Ordering::Acquire)
        };

        // first packet: declare the stream active and start detecting
        self.ops.start();
        self.set_status(StreamStatus::Active);

        let tracker = Arc::downgrade(self);
        let period = self.cycle_duration;
        tokio::spawn(detect_worker(tracker, generation, period).instrument(self.span.clone()));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn detect_changes(&self, generation: u64) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.lock();
        if state.stopped || !self.is_current(generation) {
            return;
        }

        if self.count_since_last.swap(0, Ordering::AcqRel) >= self.samples_required {
            state.cycle_count = state.cycle_count.saturating_add(1);
        } else {
            state.cycle_count = 0;
        }

        let status = if state.cycle_count == 0 {
            StreamStatus::Stopped
        } else if state.cycle_count >= self.cycles_required {
            StreamStatus::Active
        } else {
            return;
        };
        self.set_status_locked(&mut state, status);
    }

    fn set_status(&self, status: StreamStatus) {
        let mut state = self.state.lock();
        self.set_status_locked(&mut state, status);
    }

    fn set_status_locked(&self, state: &mut TrackerState, status: StreamStatus) {
        if state.status == status {
            return;
        }
        state.status = status;
        debug!(%status, "stream status changed");

        let listener = Arc::clone(&self.listener);
        self.ops.enqueue(move || listener.on_status_changed(status));
    }
}

async fn detect_worker(tracker: Weak<StreamTracker>, generation: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;

        let Some(tracker) = tracker.upgrade() else {
            return;
        };
        if !tracker.is_current(generation) {
            return;
        }
        tracker.detect_changes(generation);
    }
}
