//! A wait condition that never loses a wake signal.
//!
//! Unlike a bare condition variable, a [`WaitCondition`] remembers a
//! [`wake_one`](WaitCondition::wake_one) issued while no thread is waiting,
//! so a later [`wait`](WaitCondition::wait) returns immediately. Whether such
//! wakes accumulate or collapse is fixed per instance by [`QueueMode`].

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How wakes issued with no waiter are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Wakes collapse into one pending flag; only the first later wait
    /// returns immediately.
    #[default]
    NoQueue,
    /// Every wake is counted; N wakes let N later waits return immediately.
    Queue,
}

#[derive(Debug, Default)]
struct State {
    waiters: usize,
    /// Wakes handed to threads already blocked in `wait`.
    wakeups: usize,
    /// Wakes issued while no thread was waiting.
    pending: usize,
    /// Bumped by `wake_all` to release every current waiter.
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct WaitCondition {
    mode: QueueMode,
    state: Mutex<State>,
    condition: Condvar,
}

impl WaitCondition {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            state: Mutex::new(State::default()),
            condition: Condvar::new(),
        }
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.mode
    }

    /// Number of wakes waiting for a future `wait`.
    pub fn queue_length(&self) -> usize {
        self.state.lock().pending
    }

    /// Number of threads currently blocked in `wait`.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters
    }

    /// Blocks until woken or until `timeout` elapses; `None` waits forever.
    ///
    /// Returns `true` if a wake was received and `false` on timeout. A
    /// pending wake is consumed without blocking.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        if state.pending > 0 {
            state.pending -= 1;
            return true;
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let epoch = state.epoch;
        state.waiters += 1;
        loop {
            if state.epoch != epoch {
                // `wake_all` already took this thread off the waiter count.
                return true;
            }
            if state.wakeups > 0 {
                state.wakeups -= 1;
                state.waiters -= 1;
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.condition.wait_until(&mut state, deadline).timed_out() {
                        if state.epoch != epoch {
                            return true;
                        }
                        if state.wakeups > 0 {
                            state.wakeups -= 1;
                            state.waiters -= 1;
                            return true;
                        }
                        state.waiters -= 1;
                        return false;
                    }
                }
                None => self.condition.wait(&mut state),
            }
        }
    }

    /// Wakes one waiting thread, or records the wake if nobody is waiting.
    pub fn wake_one(&self) {
        let mut state = self.state.lock();
        if state.waiters > state.wakeups {
            state.wakeups += 1;
            self.condition.notify_one();
            return;
        }
        match self.mode {
            QueueMode::Queue => state.pending += 1,
            QueueMode::NoQueue => state.pending = 1,
        }
    }

    /// Releases every thread currently waiting. Pending wakes are cleared
    /// and nothing is recorded for future waits.
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.waiters = 0;
        state.wakeups = 0;
        state.pending = 0;
        self.condition.notify_all();
    }
}
