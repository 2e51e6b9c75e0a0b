use anyhow::{anyhow, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::StreamKey;

type FireFn = Box<dyn Fn(StreamKey, u64) + Send + 'static>;

/// Cancels one scheduled deadline. Cancelling twice is a no-op.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    key: StreamKey,
    window_id: u64,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Delay queue served by one background thread.
///
/// Each scheduled deadline calls the fire callback with the stream key and
/// window id it was armed for, unless cancelled first. Callbacks run outside
/// the queue lock.
pub struct FlushTimer {
    shared: Arc<TimerShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl FlushTimer {
    pub fn start(fire: impl Fn(StreamKey, u64) + Send + 'static) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let fire: FireFn = Box::new(fire);
        let join = std::thread::Builder::new()
            .name("digest-flush-timer".to_string())
            .spawn(move || run_timer(thread_shared, fire))
            .map_err(|e| anyhow!("failed to spawn flush timer thread: {}", e))?;
        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Arms a deadline `after` from now for `(key, window_id)`.
    pub fn schedule(&self, key: StreamKey, window_id: u64, after: Duration) -> Result<TimerHandle> {
        let due = Instant::now()
            .checked_add(after)
            .ok_or_else(|| anyhow!("flush deadline out of range"))?;
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| anyhow!("flush timer lock poisoned"))?;
            if state.stopped {
                return Err(anyhow!("flush timer stopped"));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Reverse(Entry {
                due,
                seq,
                key,
                window_id,
                cancelled: cancelled.clone(),
            }));
        }
        self.shared.wakeup.notify_one();
        Ok(TimerHandle { cancelled })
    }

    /// Deadlines still armed (not fired, not cancelled).
    pub fn pending(&self) -> usize {
        match self.shared.state.lock() {
            Ok(state) => state
                .queue
                .iter()
                .filter(|Reverse(e)| !e.cancelled.load(AtomicOrdering::SeqCst))
                .count(),
            Err(_) => 0,
        }
    }

    /// Stops the thread and drops every pending deadline without firing it.
    pub fn stop(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.stopped = true;
            state.queue.clear();
        }
        self.shared.wakeup.notify_all();
        let join = match self.join.lock() {
            Ok(mut join) => join.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("flush timer thread panicked");
            }
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(shared: Arc<TimerShared>, fire: FireFn) {
    let mut state = match shared.state.lock() {
        Ok(state) => state,
        Err(_) => {
            log::error!("flush timer lock poisoned; deadlines disabled");
            return;
        }
    };
    loop {
        if state.stopped {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while state
            .queue
            .peek()
            .is_some_and(|Reverse(entry)| entry.due <= now)
        {
            if let Some(Reverse(entry)) = state.queue.pop() {
                if !entry.cancelled.load(AtomicOrdering::SeqCst) {
                    due.push(entry);
                }
            }
        }

        if !due.is_empty() {
            drop(state);
            for entry in due {
                if entry.cancelled.swap(true, AtomicOrdering::SeqCst) {
                    continue;
                }
                fire(entry.key, entry.window_id);
            }
            state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => {
                    log::error!("flush timer lock poisoned; deadlines disabled");
                    return;
                }
            };
            continue;
        }

        let wait = state
            .queue
            .peek()
            .map(|Reverse(entry)| entry.due.saturating_duration_since(now));
        let next = match wait {
            Some(wait) => shared
                .wakeup
                .wait_timeout(state, wait)
                .ok()
                .map(|(guard, _)| guard),
            None => shared.wakeup.wait(state).ok(),
        };
        state = match next {
            Some(state) => state,
            None => {
                log::error!("flush timer lock poisoned; deadlines disabled");
                return;
            }
        };
    }
}
