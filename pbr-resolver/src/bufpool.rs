//! A lock-free pool of receive buffers that are all equal in size.
//!
//! Buffers are taken from the front of a queue and pushed to the back on
//! drop, which keeps contention low when buffers are constantly needed and
//! returned.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<SegQueue<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SegQueue::new()),
            capacity,
        }
    }

    pub fn pull(&self) -> Buffer {
        Buffer {
            inner: Some(self.inner.pop().unwrap_or_else(|| vec![0; self.capacity])),
            pool: Arc::clone(&self.inner),
        }
    }
}

pub struct Buffer {
    inner: Option<Vec<u8>>,
    pool: Arc<SegQueue<Vec<u8>>>,
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.inner
            .as_deref()
            .expect("buffer storage present until dropped")
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
            .as_deref_mut()
            .expect("buffer storage present until dropped")
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let buffer = self.inner.take().expect("storage present in Drop");

        self.pool.push(buffer);
    }
}
