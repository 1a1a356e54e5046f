use core::sync::atomic::{AtomicUsize, Ordering};

/// Counting semaphore posted from interrupt context.
///
/// `take` never sleeps on its own, the caller supplies what to do while
/// the count is zero (wfi on hardware, advance the clock in simulation).
pub struct Semaphore {
    count: AtomicUsize,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    pub fn take<F: FnMut()>(&self, mut idle: F) {
        while !self.try_take() {
            idle();
        }
    }

    /// Drop counts from wakeups nobody consumed.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_before_take() {
        let sem = Semaphore::new();
        sem.post();
        let mut spins = 0;
        sem.take(|| spins += 1);
        assert_eq!(spins, 0);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn take_idles_until_posted() {
        let sem = Semaphore::new();
        let mut spins = 0;
        sem.take(|| {
            spins += 1;
            if spins == 3 {
                sem.post();
            }
        });
        assert_eq!(spins, 3);
    }

    #[test]
    fn reset_drains() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.reset();
        assert!(!sem.try_take());
    }
}
