//! Deferred scheduling
//!
//! The runtime is single-threaded and cooperative: the engine never blocks,
//! it schedules one-shot callbacks on a `MainLoop` the host pumps. Two
//! primitives cover every suspension point in the core — `defer` (zero-delay,
//! used by the packet dispatcher) and `after` (millisecond delay, used by the
//! storage write coalescer). Both return a cancellable handle.
//!
//! The loop runs on a virtual millisecond clock advanced explicitly by the
//! host (`advance`, `run_until_idle`), which keeps dispatch and coalescing
//! order fully deterministic under test. Callbacks never nest: a callback
//! that schedules more work returns to the loop before that work runs.

use parking_lot::Mutex;
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

struct Timer {
    id: u64,
    deadline_ms: u64,
    callback: Callback,
}

struct LoopState {
    now_ms: u64,
    next_id: u64,
    timers: Vec<Timer>,
}

/// Handle to a scheduled callback. Pass it back to [`MainLoop::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

/// One-shot timer queue with a host-driven virtual clock.
#[derive(Clone)]
pub struct MainLoop {
    state: Arc<Mutex<LoopState>>,
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopState {
                now_ms: 0,
                next_id: 1,
                timers: Vec::new(),
            })),
        }
    }

    fn schedule(&self, delay_ms: u64, callback: Callback) -> TimerHandle {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let deadline_ms = state.now_ms.saturating_add(delay_ms);
        state.timers.push(Timer {
            id,
            deadline_ms,
            callback,
        });
        TimerHandle { id }
    }

    /// Schedule `callback` for the next pump at the current time.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.schedule(0, Box::new(callback))
    }

    /// Schedule `callback` to fire once `delay_ms` has elapsed.
    pub fn after(&self, delay_ms: u64, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.schedule(delay_ms, Box::new(callback))
    }

    /// Drop a scheduled callback. Returns false when the handle already
    /// fired or was cancelled.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut state = self.state.lock();
        let before = state.timers.len();
        state.timers.retain(|t| t.id != handle.id);
        state.timers.len() != before
    }

    /// Current virtual time.
    pub fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    /// Number of callbacks still scheduled (due or not).
    pub fn pending(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn pop_due(&self) -> Option<Callback> {
        let mut state = self.state.lock();
        let now = state.now_ms;
        let due = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline_ms <= now)
            .min_by_key(|(_, t)| (t.deadline_ms, t.id))
            .map(|(idx, _)| idx)?;
        Some(state.timers.swap_remove(due).callback)
    }

    /// Run at most one due callback. Returns false when nothing was due.
    pub fn run_once(&self) -> bool {
        match self.pop_due() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Run every callback due at the current time, including ones deferred
    /// by the callbacks themselves. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Advance the virtual clock by `delta_ms`, then pump everything due.
    pub fn advance(&self, delta_ms: u64) -> usize {
        {
            let mut state = self.state.lock();
            state.now_ms = state.now_ms.saturating_add(delta_ms);
        }
        self.run_pending()
    }

    /// Pump until no callback remains, jumping the clock to each next
    /// deadline. Callers own termination: a graph that reschedules itself
    /// forever will keep this loop running.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            ran += self.run_pending();
            let next = {
                let state = self.state.lock();
                state.timers.iter().map(|t| t.deadline_ms).min()
            };
            match next {
                Some(deadline) => {
                    let mut state = self.state.lock();
                    if state.now_ms < deadline {
                        state.now_ms = deadline;
                    }
                }
                None => return ran,
            }
        }
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MainLoop")
            .field("now_ms", &state.now_ms)
            .field("pending", &state.timers.len())
            .finish()
    }
}
