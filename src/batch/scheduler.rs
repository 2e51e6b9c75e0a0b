use anyhow::{anyhow, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::sink::SummarySink;
use crate::{now_epoch_ms, Detection, StreamKey};

use super::summary::FlushReason;
use super::timer::{FlushTimer, TimerHandle};
use super::window::{AcceptOutcome, BatchWindow};
use super::BatchConfig;

/// Result of submitting one detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Counted but malformed; excluded from tracking.
    Skipped,
    /// Tripped the size guard; the window was flushed before returning.
    FlushedEarly,
    /// The scheduler has shut down or the detection could not be placed.
    Rejected,
}

struct LiveWindow {
    id: u64,
    window: BatchWindow,
    deadline: Option<TimerHandle>,
}

struct Inner {
    config: BatchConfig,
    windows: Mutex<HashMap<StreamKey, LiveWindow>>,
    sink: Arc<dyn SummarySink>,
    next_window_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn lock_windows(&self) -> Result<MutexGuard<'_, HashMap<StreamKey, LiveWindow>>> {
        self.windows
            .lock()
            .map_err(|_| anyhow!("batch scheduler lock poisoned"))
    }

    /// Deadline path: flush only if `window_id` is still the live window.
    fn flush_if_current(&self, key: &StreamKey, window_id: u64) {
        let live = match self.lock_windows() {
            Ok(mut windows) => {
                if windows.get(key).is_some_and(|live| live.id == window_id) {
                    windows.remove(key)
                } else {
                    None
                }
            }
            Err(e) => {
                log::error!("deadline flush for {} failed: {}", key, e);
                return;
            }
        };
        match live {
            Some(live) => self.finish(live, FlushReason::Deadline),
            None => log::debug!("stale deadline for {} (window {}) ignored", key, window_id),
        }
    }

    /// Summarizes a window already removed from the map and hands it to the sink.
    /// Never called with the map lock held.
    fn finish(&self, live: LiveWindow, reason: FlushReason) {
        if let Some(deadline) = &live.deadline {
            deadline.cancel();
        }
        let summary = live.window.summarize(now_epoch_ms(), reason);
        log::info!(
            "flushed {} ({}): detections={} unique={} peak={}",
            summary.stream_key,
            reason,
            summary.total_detections,
            summary.unique_track_count,
            summary.peak_occupancy
        );
        let key = summary.stream_key.clone();
        if let Err(e) = self.sink.on_batch_flushed(summary) {
            log::error!("summary delivery for {} failed: {}", key, e);
        }
    }
}

/// Owns every live batch window and all timing decisions.
///
/// One coarse mutex guards the key -> window map and the windows inside it.
/// `submit` is computation-only, so the critical section is short; the sink
/// is always called after the window has left the map and the lock is free.
pub struct BatchScheduler {
    inner: Arc<Inner>,
    timer: Option<FlushTimer>,
}

impl BatchScheduler {
    /// Starts the deadline timer thread. Deadline flushes call `sink` on
    /// that one thread, so a sink that blocks delays every other stream's
    /// deadline; put network delivery behind a `ChannelSink`.
    pub fn new(config: BatchConfig, sink: Arc<dyn SummarySink>) -> Self {
        let inner = Arc::new(Inner {
            config,
            windows: Mutex::new(HashMap::new()),
            sink,
            next_window_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        let timer = match FlushTimer::start(move |key, window_id| {
            if let Some(inner) = weak.upgrade() {
                inner.flush_if_current(&key, window_id);
            }
        }) {
            Ok(timer) => Some(timer),
            Err(e) => {
                log::error!(
                    "flush timer unavailable, windows flush only on size guard or shutdown: {}",
                    e
                );
                None
            }
        };
        Self { inner, timer }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn submit(&self, detection: Detection) -> Result<SubmitOutcome> {
        let key = detection.stream_key.clone();
        let early = {
            let mut windows = self.inner.lock_windows()?;
            if self.inner.closed.load(Ordering::SeqCst) {
                log::warn!("scheduler shut down; dropping detection for {}", key);
                return Ok(SubmitOutcome::Rejected);
            }
            let live = match windows.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let id = self.inner.next_window_id.fetch_add(1, Ordering::SeqCst);
                    let deadline = self.arm_deadline(&key, id);
                    log::debug!("opened window {} for {}", id, key);
                    entry.insert(LiveWindow {
                        id,
                        window: BatchWindow::new(key.clone(), now_epoch_ms(), &self.inner.config),
                        deadline,
                    })
                }
            };
            match live.window.accept(detection) {
                AcceptOutcome::Accepted => return Ok(SubmitOutcome::Accepted),
                AcceptOutcome::Skipped => return Ok(SubmitOutcome::Skipped),
                AcceptOutcome::Rejected => return Ok(SubmitOutcome::Rejected),
                AcceptOutcome::FlushNow => windows.remove(&key),
            }
        };

        if let Some(live) = early {
            log::info!(
                "{} exceeded {} detections; flushing early",
                key,
                self.inner.config.max_batch_size
            );
            self.inner.finish(live, FlushReason::SizeGuard);
        }
        Ok(SubmitOutcome::FlushedEarly)
    }

    fn arm_deadline(&self, key: &StreamKey, window_id: u64) -> Option<TimerHandle> {
        let Some(timer) = &self.timer else {
            log::error!(
                "no flush timer for {}; window waits for size guard or shutdown",
                key
            );
            return None;
        };
        match timer.schedule(key.clone(), window_id, self.inner.config.window) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!(
                    "cannot schedule flush deadline for {}: {}; window waits for size guard or shutdown",
                    key,
                    e
                );
                None
            }
        }
    }

    /// Flushes the live window for `key`, if any. Returns whether one was flushed.
    pub fn flush(&self, key: &StreamKey) -> Result<bool> {
        let live = self.inner.lock_windows()?.remove(key);
        match live {
            Some(live) => {
                self.inner.finish(live, FlushReason::Manual);
                Ok(true)
            }
            None => {
                log::debug!("flush for {}: no live window", key);
                Ok(false)
            }
        }
    }

    /// Flushes every live window before returning. Returns how many were flushed.
    pub fn flush_all(&self) -> Result<usize> {
        self.drain(FlushReason::Manual)
    }

    fn drain(&self, reason: FlushReason) -> Result<usize> {
        let drained: Vec<LiveWindow> = {
            let mut windows = self.inner.lock_windows()?;
            let mut drained: Vec<LiveWindow> = windows.drain().map(|(_, live)| live).collect();
            drained.sort_by_key(|live| live.id);
            drained
        };
        let count = drained.len();
        for live in drained {
            self.inner.finish(live, reason);
        }
        Ok(count)
    }

    /// Stops accepting work, flushes every live window and stops the timer.
    ///
    /// Safe to call more than once; later calls flush nothing.
    pub fn shutdown(&self) -> Result<usize> {
        {
            let _windows = self.inner.lock_windows()?;
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        let flushed = self.drain(FlushReason::Shutdown)?;
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        log::info!("batch scheduler stopped; flushed {} window(s)", flushed);
        Ok(flushed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stream keys with a live window, sorted.
    pub fn live_streams(&self) -> Result<Vec<StreamKey>> {
        let mut keys: Vec<StreamKey> = self.inner.lock_windows()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Armed flush deadlines that have neither fired nor been cancelled.
    pub fn pending_deadlines(&self) -> usize {
        self.timer.as_ref().map(|t| t.pending()).unwrap_or(0)
    }
}
