//! Connection limiting with RAII guards

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts live IPC connections against a fixed maximum
#[derive(Debug)]
pub struct ConnectionPool {
    active: AtomicUsize,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_connections,
        })
    }

    /// Try to take a connection slot, `None` when the pool is full
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current >= self.max_connections {
                return None;
            }

            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ConnectionGuard { pool: self.clone() });
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases its slot on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    pool: Arc<ConnectionPool>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let pool = ConnectionPool::new(2);
        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 2);

        drop(a);
        assert_eq!(pool.active_count(), 1);
        assert!(pool.try_acquire().is_some());
    }
}
