use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Count-down latch shared by the background loops. Each loop sleeps with
/// `wait_for`; `stop()` counts the latch down to zero, which wakes every
/// sleeper immediately.
pub struct CountDownLatch {
    count: Mutex<u64>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: u64) -> Self {
        CountDownLatch {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Returns true once the latch reaches zero.
    pub fn is_zero(&self) -> bool {
        self.count() == 0
    }

    /// Sleep up to `timeout`, waking early when the latch hits zero.
    /// Returns true if the latch is zero (i.e. the loop should exit).
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return true;
        }
        self.cond.wait_for(&mut count, timeout);
        *count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_wait_for_times_out() {
        let latch = CountDownLatch::new(1);
        let start = Instant::now();
        assert!(!latch.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_count_down_wakes_waiter() {
        let latch = Arc::new(CountDownLatch::new(1));
        let latch2 = latch.clone();
        let handle = std::thread::spawn(move || latch2.wait_for(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(10));
        latch.count_down();
        assert!(handle.join().unwrap());
        assert!(latch.is_zero());
    }
}
