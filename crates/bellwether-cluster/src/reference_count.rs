//! Start/stop-once reference counting.
//!
//! A [`ReferenceCount`] wraps two actions: one that runs when the count moves
//! from 0 to 1 and one that runs when it returns from 1 to 0. Everything in
//! between only moves the counter.
//!
//! # Tiger Style
//!
//! - Transitions and their actions run under one mutex, so an action never
//!   overlaps with the opposite action
//! - A failed action still counts as a transition; callers see the error once
//!   and the next retain does not silently retry the start

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;
use tracing::warn;

type Action<E> = Box<dyn Fn() -> Result<(), E> + Send + Sync>;

/// Counter that runs `on_first` on 0→1 and `on_last` on 1→0.
///
/// Actions run synchronously on the calling thread while the internal lock is
/// held. They must not call back into the same `ReferenceCount`.
pub struct ReferenceCount<E> {
    count: Mutex<u64>,
    on_first: Action<E>,
    on_last: Action<E>,
}

impl<E> ReferenceCount<E> {
    /// Create a counter with the given transition actions.
    pub fn on<F, L>(on_first: F, on_last: L) -> Self
    where
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
        L: Fn() -> Result<(), E> + Send + Sync + 'static,
    {
        Self {
            count: Mutex::new(0),
            on_first: Box::new(on_first),
            on_last: Box::new(on_last),
        }
    }

    /// Increment the counter, running the start action if it was zero.
    ///
    /// # Errors
    ///
    /// Returns the start action's error. The counter is incremented regardless.
    pub fn retain(&self) -> Result<(), E> {
        let mut count = self.count.lock();
        let previous = *count;
        *count = previous.saturating_add(1);

        if previous == 0 {
            trace!("reference count 0 -> 1, running start action");
            (self.on_first)()?;
        }

        Ok(())
    }

    /// Decrement the counter, running the stop action if it reaches zero.
    ///
    /// Releasing a counter that is already zero is a caller bug; it is logged
    /// and ignored.
    ///
    /// # Errors
    ///
    /// Returns the stop action's error. The counter is decremented regardless.
    pub fn release(&self) -> Result<(), E> {
        let mut count = self.count.lock();
        if *count == 0 {
            warn!("reference count released without a matching retain");
            return Ok(());
        }

        *count -= 1;
        if *count == 0 {
            trace!("reference count 1 -> 0, running stop action");
            (self.on_last)()?;
        }

        Ok(())
    }

    /// Current number of outstanding retains.
    pub fn count(&self) -> u64 {
        *self.count.lock()
    }
}

impl<E> fmt::Debug for ReferenceCount<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceCount").field("count", &self.count()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;

    fn counting() -> (ReferenceCount<String>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let starts = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let s = starts.clone();
        let t = stops.clone();
        let rc = ReferenceCount::on(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        (rc, starts, stops)
    }

    #[test]
    fn test_start_runs_on_first_retain_only() {
        let (rc, starts, stops) = counting();

        rc.retain().unwrap();
        rc.retain().unwrap();
        rc.retain().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(rc.count(), 3);
    }

    #[test]
    fn test_stop_runs_on_last_release_only() {
        let (rc, starts, stops) = counting();

        rc.retain().unwrap();
        rc.retain().unwrap();
        rc.release().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        rc.release().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn test_restart_after_full_release() {
        let (rc, starts, stops) = counting();

        rc.retain().unwrap();
        rc.release().unwrap();
        rc.retain().unwrap();
        rc.release().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_release_at_zero_is_ignored() {
        let (rc, _starts, stops) = counting();

        rc.release().unwrap();

        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn test_failed_start_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let rc: ReferenceCount<String> = ReferenceCount::on(
            move || {
                a.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            },
            || Ok(()),
        );

        assert_eq!(rc.retain(), Err("boom".to_string()));
        // The transition happened; a second retain is a plain increment.
        assert_eq!(rc.retain(), Ok(()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(rc.count(), 2);
    }

    #[test]
    fn test_failed_stop_still_reaches_zero() {
        let rc: ReferenceCount<String> = ReferenceCount::on(|| Ok(()), || Err("stop failed".to_string()));

        rc.retain().unwrap();
        assert_eq!(rc.release(), Err("stop failed".to_string()));
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn test_concurrent_retain_runs_start_once() {
        let (rc, starts, stops) = counting();
        let rc = Arc::new(rc);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rc = rc.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        rc.retain().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(rc.count(), 800);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rc = rc.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        rc.release().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(rc.count(), 0);
    }
}
