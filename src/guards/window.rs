//! Fixed-window counter

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Outcome of one acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Allowed {
        remaining: u32,
        /// End of the current window (Unix milliseconds)
        reset_at_ms: i64,
    },
    Denied {
        retry_after_ms: i64,
        reset_at_ms: i64,
    },
}

/// Counter over fixed, aligned time windows.
///
/// Window id and count are packed into a single `AtomicU64`
/// (`window_id << 24 | count`) so a rollover and an increment are one CAS.
#[derive(Debug)]
pub struct WindowCounter {
    state: AtomicU64,
    last_activity: AtomicI64,
}

impl WindowCounter {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            last_activity: AtomicI64::new(Self::now_millis()),
        }
    }

    /// Current time in Unix milliseconds
    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn unpack(state: u64) -> (u64, u64) {
        (state >> COUNT_BITS, state & COUNT_MASK)
    }

    fn pack(window_id: u64, count: u64) -> u64 {
        (window_id << COUNT_BITS) | (count & COUNT_MASK)
    }

    /// Count one request in the window containing `now_ms`, admitting at
    /// most `limit` per window.
    pub fn try_acquire_at(&self, now_ms: i64, window_ms: i64, limit: u32) -> WindowDecision {
        let window_ms = window_ms.max(1);
        let limit = (limit as u64).min(COUNT_MASK);
        let now_window = (now_ms.max(0) / window_ms) as u64;

        loop {
            let current = self.state.load(Ordering::Acquire);
            let (stored_window, stored_count) = Self::unpack(current);

            // A window already advanced by another thread is never rolled back
            let window_id = now_window.max(stored_window);
            let count = if stored_window == window_id {
                stored_count
            } else {
                0
            };
            let reset_at_ms = (window_id as i64 + 1) * window_ms;

            if count >= limit {
                return WindowDecision::Denied {
                    retry_after_ms: (reset_at_ms - now_ms).max(0),
                    reset_at_ms,
                };
            }

            let next = Self::pack(window_id, count + 1);
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.last_activity.store(now_ms, Ordering::Relaxed);
                return WindowDecision::Allowed {
                    remaining: (limit - count - 1) as u32,
                    reset_at_ms,
                };
            }
            // CAS failed, retry
        }
    }

    /// Last time a request was admitted (Unix milliseconds)
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_admits_exactly_limit_per_window() {
        let counter = WindowCounter::new();
        let now = 10_000;

        for i in 0..3 {
            match counter.try_acquire_at(now, 1000, 3) {
                WindowDecision::Allowed { remaining, .. } => assert_eq!(remaining, 2 - i),
                other => panic!("expected allowed, got {:?}", other),
            }
        }

        assert!(matches!(
            counter.try_acquire_at(now + 10, 1000, 3),
            WindowDecision::Denied {
                retry_after_ms: 990,
                reset_at_ms: 11_000
            }
        ));
    }

    #[test]
    fn test_rollover_resets_count() {
        let counter = WindowCounter::new();
        assert!(matches!(
            counter.try_acquire_at(5_500, 1000, 1),
            WindowDecision::Allowed { .. }
        ));
        assert!(matches!(
            counter.try_acquire_at(5_900, 1000, 1),
            WindowDecision::Denied { .. }
        ));
        assert!(matches!(
            counter.try_acquire_at(6_000, 1000, 1),
            WindowDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let counter = Arc::new(WindowCounter::new());
        let admitted = Arc::new(AtomicU32::new(0));
        let now = 42_000;

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if let WindowDecision::Allowed { .. } = counter.try_acquire_at(now, 60_000, 50) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 50);
    }
}
