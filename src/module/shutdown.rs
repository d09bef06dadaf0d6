//! Cooperative stop flag with waits that wake up as soon as it is raised

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Stop flag shared between a worker and whoever owns it.
///
/// [`ShutdownSignal::wait`] replaces `thread::sleep` in polling loops so that a worker can be
/// stopped without waiting out its poll interval.
#[derive(Default)]
pub struct ShutdownSignal {
    /// Raised once, never cleared
    raised: AtomicBool,
    /// Wakes sleeping waiters
    condvar: Condvar,
    /// Paired with `condvar`
    mutex: Mutex<()>,
}

impl ShutdownSignal {
    /// Creates a lowered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes every waiter
    pub fn trigger(&self) {
        // taking the lock orders the store against a waiter's check
        let _lock = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.raised.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    /// Whether the signal has been raised
    pub fn is_shutdown(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until the signal is raised.
    ///
    /// Returns `true` if the signal was raised.
    pub fn wait(&self, duration: Duration) -> bool {
        let lock = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let (_lock, _) = self
            .condvar
            .wait_timeout_while(lock, duration, |_| !self.is_shutdown())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        signal.trigger();
        assert!(signal.is_shutdown());
        // stays raised
        signal.trigger();
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_wait_times_out() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    /// A raised signal ends a long wait early
    fn test_wait_interrupted() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (signal.wait(Duration::from_secs(10)), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        signal.trigger();

        let (raised, elapsed) = waiter.join().unwrap();
        assert!(raised);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
