//! Packet buffer pooling for the forwarding path.
//!
//! Every packet read from or written to a TUN device travels in a
//! [`Payload`] taken from the process-wide [`PayloadPool`]. Buffers are
//! allocated once at full capacity and then recycled, so steady-state
//! forwarding does not touch the allocator.
//!
//! # Ownership
//!
//! A payload is owned by exactly one party at a time: the pool, the read
//! path, or the write path. Moving it by value enforces this; releasing it
//! consumes it so the caller cannot touch it afterwards.

use crossbeam_queue::ArrayQueue;
use std::fmt;

/// Default payload capacity in bytes.
///
/// Large enough for the biggest MTU accepted by the configuration (9000)
/// plus headroom for link-layer framing.
pub const DEFAULT_PAYLOAD_CAPACITY: usize = 9216;

/// Default number of idle payloads kept for reuse.
pub const DEFAULT_POOL_IDLE: usize = 4096;

/// A reusable packet buffer with a logical length.
pub struct Payload {
    data: Box<[u8]>,
    len: usize,
}

impl Payload {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Backing capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Logical length (number of valid bytes).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the payload holds no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the logical length, clamped to the backing capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len(), "payload length exceeds capacity");
        self.len = len.min(self.data.len());
    }

    /// The valid bytes of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing buffer, for reading a packet into.
    ///
    /// Bytes beyond the current length have undefined (stale) contents.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` into the payload and set the length accordingly.
    ///
    /// Returns `false` (leaving the payload untouched) if `src` does not fit.
    pub fn fill_from(&mut self, src: &[u8]) -> bool {
        if src.len() > self.data.len() {
            return false;
        }
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
        true
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Lock-free pool of [`Payload`] buffers shared by all sessions.
///
/// `acquire` never fails: when no idle payload is available a new one is
/// allocated. `release` keeps up to `max_idle` payloads for reuse and drops
/// the rest.
pub struct PayloadPool {
    idle: ArrayQueue<Payload>,
    capacity: usize,
}

impl PayloadPool {
    /// Create a pool handing out payloads of `capacity` bytes.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            idle: ArrayQueue::new(max_idle.max(1)),
            capacity,
        }
    }

    /// Number of idle payloads currently held.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Take a payload ready for writing. Its length is reset to zero.
    pub fn acquire(&self) -> Payload {
        match self.idle.pop() {
            Some(mut payload) => {
                payload.len = 0;
                payload
            }
            None => Payload::with_capacity(self.capacity),
        }
    }

    /// Return a payload for reuse.
    pub fn release(&self, payload: Payload) {
        // Foreign-sized buffers would break the capacity guarantee.
        if payload.capacity() != self.capacity {
            return;
        }
        // Pool full: let the buffer drop.
        let _ = self.idle.push(payload);
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_CAPACITY, DEFAULT_POOL_IDLE)
    }
}

impl fmt::Debug for PayloadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_allocates_full_capacity() {
        let pool = PayloadPool::new(1500, 8);
        let pl = pool.acquire();
        assert_eq!(pl.capacity(), 1500);
        assert!(pl.is_empty());
    }

    #[test]
    fn test_released_payload_is_reused_without_residual_length() {
        let pool = PayloadPool::new(256, 8);
        let mut pl = pool.acquire();
        assert!(pl.fill_from(&[0xab; 200]));
        assert_eq!(pl.len(), 200);
        pool.release(pl);
        assert_eq!(pool.idle(), 1);

        let mut again = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(again.len(), 0);
        assert_eq!(again.buf_mut().len(), 256);
        again.set_len(256);
        assert_eq!(again.as_bytes().len(), 256);
    }

    #[test]
    fn test_fill_rejects_oversized_data() {
        let pool = PayloadPool::new(4, 1);
        let mut pl = pool.acquire();
        assert!(!pl.fill_from(&[1, 2, 3, 4, 5]));
        assert!(pl.is_empty());
    }

    #[test]
    fn test_pool_drops_beyond_max_idle() {
        let pool = PayloadPool::new(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_foreign_capacity_is_not_pooled() {
        let small = PayloadPool::new(32, 4);
        let large = PayloadPool::new(64, 4);
        large.release(small.acquire());
        assert_eq!(large.idle(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(PayloadPool::new(128, 64));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 0..1000 {
                        let mut pl = pool.acquire();
                        assert!(pl.fill_from(&[i as u8; 16][..(n % 16)]));
                        assert_eq!(pl.len(), n % 16);
                        pool.release(pl);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= 64);
    }
}
