//! The coin-waiter queue.
//!
//! Clients announce their swap transactions before the chain has necessarily
//! seen them, so every init and redeem resolves through a deferred probe. A
//! single ticker thread retries each waiter at a fixed interval until it
//! reports done, its absolute expiry passes, or the queue is cancelled. No
//! per-waiter thread is ever spawned; waiters are small closures.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Mutex,
    },
    thread,
    time::Duration,
};

use crate::utill::now_ms;

/// Outcome of one waiter probe.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TryStatus {
    /// Not resolved yet, probe again next tick.
    TryAgain,
    /// Resolved (successfully or terminally); drop the waiter.
    Done,
}

/// A deferred probe with an absolute expiry.
pub(crate) struct Waiter {
    /// Expiry, milliseconds. Checked after a `TryAgain`; an expired waiter
    /// gets its `expire_fn` instead of further probes.
    pub(crate) expiration: u64,
    pub(crate) try_fn: Box<dyn FnMut() -> TryStatus + Send>,
    pub(crate) expire_fn: Box<dyn FnOnce() + Send>,
}

/// A single-threaded cooperative retry queue. Ordering across waiters is not
/// guaranteed.
pub(crate) struct TickerQueue {
    waiters: Mutex<Vec<Waiter>>,
    interval: Duration,
}

impl TickerQueue {
    pub(crate) fn new(interval: Duration) -> Self {
        TickerQueue {
            waiters: Mutex::new(Vec::new()),
            interval,
        }
    }

    /// Enqueue a waiter. First probe happens on the next tick.
    pub(crate) fn wait(&self, waiter: Waiter) {
        self.waiters.lock().expect("waiter queue poisoned").push(waiter);
    }

    /// Run the ticker until cancelled. Pending waiters are left enqueued on
    /// cancellation so the host can persist them.
    pub(crate) fn run(&self, cancelled: &AtomicBool) {
        while !cancelled.load(Relaxed) {
            thread::sleep(self.interval);
            self.tick(cancelled);
        }
        log::debug!(
            "waiter queue stopped with {} live waiters",
            self.waiters.lock().expect("waiter queue poisoned").len()
        );
    }

    /// Probe every queued waiter once. Cancellation between probes preempts
    /// the remaining fires; unprobed waiters stay queued.
    pub(crate) fn tick(&self, cancelled: &AtomicBool) {
        let current = {
            let mut waiters = self.waiters.lock().expect("waiter queue poisoned");
            mem::take(&mut *waiters)
        };

        let now = now_ms();
        let mut kept = Vec::new();
        for mut waiter in current {
            if cancelled.load(Relaxed) {
                kept.push(waiter);
                continue;
            }
            match (waiter.try_fn)() {
                TryStatus::Done => {}
                TryStatus::TryAgain => {
                    if now >= waiter.expiration {
                        (waiter.expire_fn)();
                    } else {
                        kept.push(waiter);
                    }
                }
            }
        }

        if !kept.is_empty() {
            let mut waiters = self.waiters.lock().expect("waiter queue poisoned");
            waiters.extend(kept);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn queue() -> TickerQueue {
        TickerQueue::new(Duration::from_millis(10))
    }

    #[test]
    fn test_retries_until_done() {
        let q = queue();
        let tries = Arc::new(AtomicU32::new(0));
        let tries_c = tries.clone();
        q.wait(Waiter {
            expiration: now_ms() + 60_000,
            try_fn: Box::new(move || {
                if tries_c.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    TryStatus::TryAgain
                } else {
                    TryStatus::Done
                }
            }),
            expire_fn: Box::new(|| panic!("must not expire")),
        });

        let cancelled = AtomicBool::new(false);
        for _ in 0..5 {
            q.tick(&cancelled);
        }
        assert_eq!(tries.load(Ordering::SeqCst), 3);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_expires_after_deadline() {
        let q = queue();
        let expired = Arc::new(AtomicU32::new(0));
        let expired_c = expired.clone();
        q.wait(Waiter {
            expiration: now_ms().saturating_sub(1),
            try_fn: Box::new(|| TryStatus::TryAgain),
            expire_fn: Box::new(move || {
                expired_c.fetch_add(1, Ordering::SeqCst);
            }),
        });

        let cancelled = AtomicBool::new(false);
        q.tick(&cancelled);
        q.tick(&cancelled);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_cancellation_preempts_fires() {
        let q = queue();
        let tries = Arc::new(AtomicU32::new(0));
        let tries_c = tries.clone();
        q.wait(Waiter {
            expiration: now_ms() + 60_000,
            try_fn: Box::new(move || {
                tries_c.fetch_add(1, Ordering::SeqCst);
                TryStatus::TryAgain
            }),
            expire_fn: Box::new(|| panic!("must not expire")),
        });

        let cancelled = AtomicBool::new(true);
        q.tick(&cancelled);
        // Never probed, still queued for persistence.
        assert_eq!(tries.load(Ordering::SeqCst), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_done_waiter_never_fires_again() {
        let q = queue();
        let tries = Arc::new(AtomicU32::new(0));
        let tries_c = tries.clone();
        q.wait(Waiter {
            // Already past expiry; Done on the first probe must still win.
            expiration: now_ms().saturating_sub(1),
            try_fn: Box::new(move || {
                tries_c.fetch_add(1, Ordering::SeqCst);
                TryStatus::Done
            }),
            expire_fn: Box::new(|| panic!("must not expire after done")),
        });

        let cancelled = AtomicBool::new(false);
        q.tick(&cancelled);
        q.tick(&cancelled);
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }
}
