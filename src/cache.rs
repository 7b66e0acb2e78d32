//! Pool of reusable byte buffers for composing response heads.

use crate::limits::RespLimits;
use std::sync::{Mutex, PoisonError};

/// Buffer pool shared by every connection of a server.
///
/// Built once by [`ServerBuilder::build`](crate::ServerBuilder::build) and
/// handed to connections as an `Arc`. Buffers that grew past `max_capacity` are shrunk back on return,
/// and the pool never keeps more than `pool_capacity` of them.
///
/// # Examples
/// ```
/// use maker_net::{HrmCache, limits::RespLimits};
///
/// let cache = HrmCache::new(&RespLimits::default());
///
/// let mut buffer = cache.pop();
/// buffer.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
/// cache.push(buffer);
///
/// assert_eq!(cache.len(), 1);
/// assert!(cache.pop().is_empty());
/// ```
#[derive(Debug)]
pub struct HrmCache {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    default_capacity: usize,
    max_capacity: usize,
}

impl HrmCache {
    pub fn new(limits: &RespLimits) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(limits.pool_capacity)),
            capacity: limits.pool_capacity,
            default_capacity: limits.default_capacity,
            max_capacity: limits.max_capacity,
        }
    }

    /// An empty buffer, reused when one is available.
    pub fn pop(&self) -> Vec<u8> {
        self.lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.default_capacity))
    }

    /// Returns a buffer to the pool.
    pub fn push(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if buffer.capacity() > self.max_capacity {
            buffer.shrink_to(self.default_capacity);
        }

        let mut buffers = self.lock();
        buffers.push(buffer);
        buffers.truncate(self.capacity);
    }

    /// Drops pooled buffers until at most `size` remain.
    pub fn rescale(&self, size: usize) {
        self.lock().truncate(size);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HrmCache {
    fn default() -> Self {
        Self::new(&RespLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded() {
        let limits = RespLimits {
            default_capacity: 16,
            max_capacity: 64,
            pool_capacity: 2,
            ..RespLimits::default()
        };
        let cache = HrmCache::new(&limits);

        assert_eq!(cache.pop().capacity(), 16);

        for _ in 0..5 {
            cache.push(Vec::with_capacity(8));
        }
        assert_eq!(cache.len(), 2);

        cache.push(vec![0; 1024]);
        let buffer = cache.pop();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() < 1024);

        cache.rescale(0);
        assert!(cache.is_empty());
    }
}
