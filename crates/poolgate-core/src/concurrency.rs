use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::emit::ClientEmitter;

/// A unit of admitted concurrency belongs to either a user or an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    User(i64),
    Account(i64),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot wait queue is full")]
    QueueFull,
    #[error("timed out waiting for a slot")]
    Timeout,
    #[error("request cancelled while waiting for a slot")]
    Cancelled,
}

/// Wait-queue bound for a scope with the given concurrency limit. Monotone
/// and saturating: small limits may queue up to their own size, large limits
/// cap out at 32 pending requests.
pub fn calculate_max_wait(concurrency: i32) -> u32 {
    let c = concurrency.max(0) as u32;
    c.max((4 * c).min(32))
}

#[derive(Debug, Default)]
struct SlotQueue {
    active: u32,
    waiting: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct ScopeSlots {
    state: Mutex<SlotQueue>,
}

impl ScopeSlots {
    /// Hand the freed slot to the oldest live waiter, otherwise decrement.
    /// A waiter whose receiver is gone (timeout, disconnect) is skipped.
    fn release(&self) {
        let mut state = self.state.lock().expect("slot state poisoned");
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// Process-wide active/waiting counters per scope, with FIFO hand-off of
/// released slots. Wait-queue admission (`increment_wait`) is a separate
/// non-blocking gate so that `waiting` only ever counts admitted requests.
#[derive(Default)]
pub struct SlotController {
    scopes: Mutex<HashMap<Scope, Arc<ScopeSlots>>>,
}

impl SlotController {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, scope: Scope) -> Arc<ScopeSlots> {
        let mut scopes = self.scopes.lock().expect("scope map poisoned");
        scopes.entry(scope).or_default().clone()
    }

    /// Current `(active, waiting)` for a scope.
    pub fn load(&self, scope: Scope) -> (u32, u32) {
        let slots = self.slots(scope);
        let state = slots.state.lock().expect("slot state poisoned");
        (state.active, state.waiting)
    }

    /// Admit a request to the wait queue iff it is not full. Never blocks.
    pub fn increment_wait(&self, scope: Scope, max_waiting: u32) -> bool {
        let slots = self.slots(scope);
        let mut state = slots.state.lock().expect("slot state poisoned");
        if state.waiting >= max_waiting {
            return false;
        }
        state.waiting += 1;
        true
    }

    /// Callers invoke this at most once per successful `increment_wait`.
    pub fn decrement_wait(&self, scope: Scope) {
        let slots = self.slots(scope);
        let mut state = slots.state.lock().expect("slot state poisoned");
        state.waiting = state.waiting.saturating_sub(1);
    }

    /// Reserve a slot if one is free right now.
    pub fn try_acquire(&self, scope: Scope, max_active: u32) -> Option<SlotPermit> {
        let slots = self.slots(scope);
        {
            let mut state = slots.state.lock().expect("slot state poisoned");
            if state.active >= max_active {
                return None;
            }
            state.active += 1;
        }
        Some(SlotPermit::new(slots))
    }

    /// Reserve a slot, suspending until one frees up, the deadline passes, or
    /// the client disconnects. While suspended, stream-capable requests get a
    /// heartbeat every `ping_interval` so the connection stays alive.
    pub async fn acquire_with_wait(
        &self,
        scope: Scope,
        max_active: u32,
        timeout: Duration,
        ping_interval: Option<Duration>,
        emitter: &mut ClientEmitter,
    ) -> Result<SlotPermit, SlotError> {
        let slots = self.slots(scope);
        let mut rx = {
            let mut state = slots.state.lock().expect("slot state poisoned");
            if state.active < max_active {
                state.active += 1;
                drop(state);
                return Ok(SlotPermit::new(slots));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let cancel = emitter.cancellation();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = ping_interval.filter(|d| !d.is_zero()).map(|interval| {
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval)
        });

        enum WaitOutcome {
            Granted,
            SenderGone,
            TimedOut,
            ClientGone,
        }

        let outcome = loop {
            tokio::select! {
                granted = &mut rx => {
                    break match granted {
                        Ok(()) => WaitOutcome::Granted,
                        // Sender discarded without a grant.
                        Err(_) => WaitOutcome::SenderGone,
                    };
                }
                _ = &mut deadline => break WaitOutcome::TimedOut,
                _ = cancel.cancelled() => break WaitOutcome::ClientGone,
                _ = tick(&mut ticker) => {
                    emitter.ping().await;
                }
            }
        };

        match outcome {
            WaitOutcome::Granted => Ok(SlotPermit::new(slots)),
            WaitOutcome::SenderGone => Err(SlotError::Cancelled),
            WaitOutcome::TimedOut => {
                // The grant may have raced the deadline; taking it beats
                // bouncing the slot back through the queue.
                match rx.try_recv() {
                    Ok(()) => Ok(SlotPermit::new(slots)),
                    Err(_) => {
                        debug!(scope = ?scope, "slot wait timed out");
                        Err(SlotError::Timeout)
                    }
                }
            }
            WaitOutcome::ClientGone => {
                if rx.try_recv().is_ok() {
                    // Slot was granted concurrently; give it straight back.
                    SlotPermit::new(slots).release();
                }
                Err(SlotError::Cancelled)
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// A reserved slot. Released exactly once: explicitly via `release`, or on
/// drop, which also covers panics and client-disconnect unwinding.
#[derive(Debug)]
pub struct SlotPermit {
    slots: Option<Arc<ScopeSlots>>,
}

impl SlotPermit {
    fn new(slots: Arc<ScopeSlots>) -> Self {
        Self { slots: Some(slots) }
    }

    pub fn release(mut self) {
        if let Some(slots) = self.slots.take() {
            slots.release();
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.release();
        }
    }
}
