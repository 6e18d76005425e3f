//! Completion signal used to bridge asynchronous frame delivery back into
//! blocking calls.
//!
//! The scheduler delivers frames through callbacks; the synchronous
//! [`Core::get_frame`](crate::Core::get_frame) path parks the caller on a
//! [`Completion`] until the callback fires. It encapsulates the atomic flag,
//! mutex, and condvar pattern so callers never spin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A one-shot completion signal carrying a payload.
///
/// One thread signals with a value, any number of threads wait for it. The
/// payload is taken by the first waiter to observe it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use frameflow::Completion;
///
/// let completion = Arc::new(Completion::new());
/// let signaler = Arc::clone(&completion);
/// thread::spawn(move || signaler.signal(42));
/// assert_eq!(completion.wait(), 42);
/// ```
pub struct Completion<T> {
    completed: AtomicBool,
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates a new signal in the incomplete state.
    pub fn new() -> Self {
        Completion {
            completed: AtomicBool::new(false),
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Signals completion with a value and wakes all waiting threads.
    ///
    /// Signaling more than once keeps the first value.
    pub fn signal(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
        }
        self.completed.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Non-blocking, lock-free check for completion.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Blocks until the signal fires and takes the payload.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.cv.wait(&mut slot);
        }
    }

    /// Blocks up to `timeout` for the signal; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if self.cv.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_starts_incomplete() {
        let c: Completion<i32> = Completion::new();
        assert!(!c.is_complete());
    }

    #[test]
    fn test_signal_before_wait() {
        let c = Completion::new();
        c.signal(7);
        assert!(c.is_complete());
        assert_eq!(c.wait(), 7);
    }

    #[test]
    fn test_wait_then_signal() {
        let c = Arc::new(Completion::new());
        let signaler = Arc::clone(&c);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal("done");
        });
        assert_eq!(c.wait(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_first_signal_wins() {
        let c = Completion::new();
        c.signal(1);
        c.signal(2);
        assert_eq!(c.wait(), 1);
    }

    #[test]
    fn test_timeout_expires() {
        let c: Completion<i32> = Completion::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_timeout_receives_value() {
        let c = Arc::new(Completion::new());
        let signaler = Arc::clone(&c);
        thread::spawn(move || signaler.signal(5));
        assert_eq!(c.wait_timeout(Duration::from_secs(5)), Some(5));
    }

    #[test]
    fn test_concurrent_signal_and_wait() {
        for i in 0..100 {
            let c = Arc::new(Completion::new());
            let signaler = Arc::clone(&c);
            let handle = thread::spawn(move || signaler.signal(i));
            assert_eq!(c.wait(), i);
            handle.join().unwrap();
        }
    }
}
