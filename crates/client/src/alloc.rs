//! Monotonic handle allocation.
//!
//! Each handle namespace (requests, WebSocket connections) gets its own
//! allocator instance, so the two counters advance independently. Handles
//! start at zero and strictly increase for the allocator's lifetime.

use std::sync::atomic::{AtomicI32, Ordering};

/// Issues unique, strictly increasing non-negative ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicI32,
}

impl IdAllocator {
    /// Creates an allocator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id.
    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_zero_and_strictly_increase() {
        let alloc = IdAllocator::new();
        let issued: Vec<i32> = (0..100).map(|_| alloc.next()).collect();
        assert_eq!(issued[0], 0);
        for window in issued.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn namespaces_are_independent() {
        let requests = IdAllocator::new();
        let connections = IdAllocator::new();
        assert_eq!(requests.next(), 0);
        assert_eq!(requests.next(), 1);
        assert_eq!(connections.next(), 0);
    }
}
