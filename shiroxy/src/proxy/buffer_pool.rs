//! Pooled copy buffers
//!
//! Body copies — streamed request/response payloads and upgrade tunnels
//! alike — stage through fixed-size buffers instead of allocating per
//! connection. A buffer returned with capacity below the pool's
//! configured size is discarded.

use std::sync::Mutex;

/// Default size for buffers in the pool.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

pub struct BufferPool {
    size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        Self {
            size,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer of exactly the pool size.
    pub fn get(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().unwrap();
        match pool.pop() {
            Some(mut buf) => {
                buf.resize(self.size, 0);
                buf
            }
            None => vec![0u8; self.size],
        }
    }

    /// Return a buffer. Undersized buffers are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.size {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        pool.push(buf);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
