//! Bounded-concurrency task gate.
//!
//! A [`Throttle`] admits at most `limit` tasks at a time and queues the rest
//! in FIFO order. Admission is represented by a [`Permit`]; dropping the
//! permit frees the slot and hands it to the oldest waiter.
//!
//! The store uses two gates: a paused gate of limit 1 that holds operations
//! until the index rebuild finishes, and a wider gate bounding concurrent
//! backend calls.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug)]
struct GateState {
    limit: usize,
    running: usize,
    paused: bool,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

impl GateState {
    /// Hands free slots to waiters. Must be called with the lock held.
    fn dispatch(&mut self, gate: &Arc<Mutex<GateState>>) {
        while !self.paused && self.running < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.running += 1;
            if let Err(mut permit) = waiter.send(Permit::armed(gate)) {
                // The waiter gave up; take the slot back without re-locking.
                permit.gate = None;
                self.running -= 1;
            }
        }
    }
}

/// Admission to a [`Throttle`]; releases the slot on drop.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    gate: Option<Arc<Mutex<GateState>>>,
}

impl Permit {
    fn armed(gate: &Arc<Mutex<GateState>>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("armed", &self.gate.is_some())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            let mut state = gate.lock();
            state.running -= 1;
            state.dispatch(&gate);
        }
    }
}

/// FIFO gate with a fixed number of concurrent slots.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct Throttle {
    state: Arc<Mutex<GateState>>,
}

impl Throttle {
    /// Creates a running gate.
    ///
    /// A limit of zero is treated as one.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                limit: limit.max(1),
                running: 0,
                paused: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Creates a gate that admits nothing until [`resume`](Self::resume).
    #[must_use]
    pub fn paused(limit: usize) -> Self {
        let gate = Self::new(limit);
        gate.pause();
        gate
    }

    /// Waits for a slot.
    ///
    /// Waiters are admitted in arrival order. Dropping the returned future
    /// before it completes gives up the place in the queue.
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if !state.paused && state.running < state.limit && state.waiters.is_empty() {
                    state.running += 1;
                    return Permit::armed(&self.state);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Runs `task` once admitted and returns its output.
    ///
    /// The gate does not retry; a failing task reports to its caller only.
    pub async fn push<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }

    /// Stops admitting waiters. Running tasks are unaffected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Resumes admission and wakes queued waiters up to the limit.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.dispatch(&self.state);
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Tasks currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().running
    }

    /// Tasks waiting for a slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Maximum concurrent tasks.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Throttle")
            .field("limit", &state.limit)
            .field("running", &state.running)
            .field("paused", &state.paused)
            .field("queued", &state.waiters.len())
            .finish()
    }
}
