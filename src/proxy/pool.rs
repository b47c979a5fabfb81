//! Reusable copy buffers for tunnels

use parking_lot::Mutex;

/// Working size of a tunnel copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Source of temporary byte buffers for tunnel copy loops.
///
/// Buffers are handed back with [`put`](BytesPool::put) after use and are not
/// zeroed in between.
pub trait BytesPool: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

impl<P: BytesPool + ?Sized> BytesPool for std::sync::Arc<P> {
    fn get(&self) -> Vec<u8> {
        (**self).get()
    }

    fn put(&self, buf: Vec<u8>) {
        (**self).put(buf)
    }
}

/// Bounded free-list of fixed-size buffers
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, 64)
    }
}

impl BufferPool {
    /// Create a pool of `buffer_size` buffers keeping at most `max_idle` around
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl BytesPool for BufferPool {
    fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    fn put(&self, buf: Vec<u8>) {
        // Foreign sizes would change the working size of later tunnels.
        if buf.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}
