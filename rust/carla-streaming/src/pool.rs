//! Reusable byte buffers for the client read loop.
//!
//! Every frame a reader delivers is copied out of the shared region into a
//! pooled buffer; returning the buffer to the pool (on drop) keeps its
//! capacity, so a steady-state reader stops allocating once buffers have
//! grown to the stream's frame size.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

type Free = Arc<Mutex<Vec<Vec<u8>>>>;

/// An unbounded pool of reusable byte buffers. Cloning shares the pool.
#[derive(Clone, Default)]
pub struct BufferPool {
    free: Free,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer from the pool, or a fresh empty one.
    pub fn pop(&self) -> Buffer {
        let data = self.free.lock().unwrap().pop().unwrap_or_default();
        Buffer {
            data,
            free: self.free.clone(),
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A pooled byte buffer; returns to its pool on drop.
pub struct Buffer {
    data: Vec<u8>,
    free: Free,
}

impl Buffer {
    /// Replace the contents with a copy of `bytes`.
    pub fn copy_from(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.data.len()).finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        self.free.lock().unwrap().push(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_the_pool() {
        let pool = BufferPool::new();
        assert_eq!(pool.idle(), 0);

        let mut buffer = pool.pop();
        buffer.copy_from(&[1, 2, 3]);
        assert_eq!(&*buffer, &[1, 2, 3]);
        drop(buffer);

        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn reused_buffers_keep_capacity_not_contents() {
        let pool = BufferPool::new();

        let mut buffer = pool.pop();
        buffer.copy_from(&[7u8; 4096]);
        drop(buffer);

        let reused = pool.pop();
        assert!(reused.is_empty());
        assert_eq!(pool.idle(), 0);
    }
}
