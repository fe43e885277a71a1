//! Bounded connection concurrency

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MAX_CONNECTIONS;

/// Caps how many connections the accept loops hand to handlers
///
/// Accept loops call [`ConnectionLimiter::try_acquire`] per accepted
/// stream; once the cap is reached the stream is rejected at accept
/// time rather than queued. Dropping the returned guard frees the slot.
#[derive(Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
}

impl ConnectionLimiter {
    /// Create a limiter admitting up to `capacity` connections at once
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Claim a slot; `None` means the limit is reached and the
    /// connection should be rejected
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionGuard { _permit: permit })
    }

    /// Slots currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS)
    }
}

/// Held for the lifetime of one served connection
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_past_capacity() {
        let limiter = ConnectionLimiter::new(2);
        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert_eq!(limiter.available(), 0);
        assert!(limiter.try_acquire().is_none());

        drop(a);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_guard_drop_frees_slot() {
        let limiter = ConnectionLimiter::new(1);
        {
            let _guard = limiter.try_acquire().unwrap();
            assert_eq!(limiter.available(), 0);
        }
        assert_eq!(limiter.available(), 1);
    }
}
