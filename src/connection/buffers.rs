use crate::utils::HealthFlag;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reusable encode buffers of one connection.
///
/// Buffers are created on demand, so the number ever created is bounded by
/// the peak number of concurrent senders. A buffer is in exactly one place at
/// a time: the free queue or a single [`PooledBuffer`].
pub struct BufferPool {
    free: SegQueue<Vec<u8>>,
    capacity: usize,
    created: AtomicUsize,
    in_use: AtomicUsize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: SegQueue::new(),
            capacity,
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take a cleared buffer out of the pool. On drop it goes back to the
    /// pool while `alive` is up and is freed otherwise; the check happens
    /// under `gate` so it cannot interleave with a dispose that drains the pool.
    pub fn checkout<'a>(&'a self, alive: &'a HealthFlag, gate: &'a Mutex<()>) -> PooledBuffer<'a> {
        let buf = self.free.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(self.capacity)
        });
        self.in_use.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self,
            alive,
            gate,
        }
    }

    /// Free every pooled buffer, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.free.pop().is_some() {
            n += 1;
        }
        n
    }

    /// Buffers ever allocated.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Buffers sitting in the free queue.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
    alive: &'a HealthFlag,
    gate: &'a Mutex<()>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        {
            let _gate = self.gate.lock();
            if self.alive.get() {
                self.pool.free.push(buf);
            }
        }
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}
