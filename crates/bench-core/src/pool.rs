//! Reusable payload buffers.
//!
//! A buffer is checked out by the producer, filled, moved into a batch and
//! checked back in when the worker drops that batch. Holding the buffer by
//! value makes reuse before check-in impossible; the generation counter lets
//! tests confirm that a buffer handed out again is a fresh checkout.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A byte buffer checked out from a [`BufferPool`]. Returns to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    generation: u64,
    pool: Option<Weak<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer not backed by any pool.
    pub fn standalone(capacity: usize) -> Self {
        Self {
            buf: Some(Vec::with_capacity(capacity)),
            generation: 0,
            pool: None,
        }
    }

    /// Checkout number this buffer was handed out under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(bytes);
        }
    }

    pub fn push(&mut self, byte: u8) {
        if let Some(buf) = self.buf.as_mut() {
            buf.push(byte);
        }
    }

    /// Copy of the contents, for clients that need an owned body.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(weak) = self.pool.take() {
            if let Some(pool) = weak.upgrade() {
                if let Some(buf) = self.buf.take() {
                    pool.check_in(buf);
                }
            }
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("generation", &self.generation)
            .finish()
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_pooled: usize,
    checkouts: AtomicU64,
    check_ins: AtomicU64,
}

impl PoolInner {
    fn check_in(&self, mut buf: Vec<u8>) {
        self.check_ins.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// Pool of byte buffers shared between the producer and the workers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// `max_pooled` bounds how many idle buffers are retained.
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_capacity,
                max_pooled,
                checkouts: AtomicU64::new(0),
                check_ins: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer, reusing an idle one when available.
    pub fn check_out(&self) -> PooledBuffer {
        let generation = self.inner.checkouts.fetch_add(1, Ordering::Relaxed) + 1;
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_capacity));
        PooledBuffer {
            buf: Some(buf),
            generation,
            pool: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Number of idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> u64 {
        self.inner.checkouts.load(Ordering::Relaxed) - self.inner.check_ins.load(Ordering::Relaxed)
    }

    pub fn checkouts(&self) -> u64 {
        self.inner.checkouts.load(Ordering::Relaxed)
    }
}
