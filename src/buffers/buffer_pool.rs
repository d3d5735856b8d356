use crate::buffers::fixed_buffer::FixedBuf;
use std::sync::Mutex;
use tracing::{debug, trace};

/// A pool of reusable buffers of a single fixed capacity.
///
/// The pool's only invariant is capacity membership: buffers handed out always have the
///  pool's capacity, and buffers with any other capacity are silently discarded when
///  returned (and reclaimed by the regular allocator). Buffer *contents* are not reset
///  beyond clearing the length, so callers must not assume zeroed memory on reuse.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        if buffer.capacity() != self.buf_size {
            debug!("returned buffer has capacity {} instead of {}: discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// The three size classes of [`TieredBufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Small,
    Medium,
    Large,
}

/// Size-classed buffer pools: one [`BufferPool`] per class, with a round-up lookup for
///  callers that know the size they need rather than the class.
///
/// This is purely a performance optimization - a buffer larger than the largest class is
///  allocated directly and will not be retained when returned.
///
/// A `TieredBufferPool` is constructed explicitly and passed to the channels that use it,
///  one instance per process (or per test).
pub struct TieredBufferPool {
    small: BufferPool,
    medium: BufferPool,
    large: BufferPool,
}

impl TieredBufferPool {
    pub fn new(small_size: usize, medium_size: usize, large_size: usize, max_pool_size: usize) -> Self {
        assert!(small_size < medium_size && medium_size < large_size,
                "buffer size classes must be strictly increasing: {} / {} / {}", small_size, medium_size, large_size);

        TieredBufferPool {
            small: BufferPool::new(small_size, max_pool_size),
            medium: BufferPool::new(medium_size, max_pool_size),
            large: BufferPool::new(large_size, max_pool_size),
        }
    }

    fn class_pool(&self, class: BufferClass) -> &BufferPool {
        match class {
            BufferClass::Small => &self.small,
            BufferClass::Medium => &self.medium,
            BufferClass::Large => &self.large,
        }
    }

    pub fn class_size(&self, class: BufferClass) -> usize {
        self.class_pool(class).buf_size()
    }

    pub fn get(&self, class: BufferClass) -> FixedBuf {
        self.class_pool(class).get_from_pool()
    }

    /// Get a buffer that holds at least `size` bytes: the smallest class whose capacity is
    ///  sufficient, or a directly allocated (unpooled) buffer beyond the largest class.
    pub fn get_for_size(&self, size: usize) -> FixedBuf {
        if size <= self.small.buf_size() {
            self.small.get_from_pool()
        }
        else if size <= self.medium.buf_size() {
            self.medium.get_from_pool()
        }
        else if size <= self.large.buf_size() {
            self.large.get_from_pool()
        }
        else {
            debug!("requested size {} exceeds the largest pooled class: allocating directly", size);
            FixedBuf::new(size)
        }
    }

    /// Return a buffer to the pool of its size class. Buffers whose capacity matches no
    ///  class (e.g. oversized buffers from [`Self::get_for_size`]) are silently discarded.
    pub fn return_to_pool(&self, buffer: FixedBuf) {
        if buffer.capacity() == self.small.buf_size() {
            self.small.return_to_pool(buffer);
        }
        else if buffer.capacity() == self.medium.buf_size() {
            self.medium.return_to_pool(buffer);
        }
        else if buffer.capacity() == self.large.buf_size() {
            self.large.return_to_pool(buffer);
        }
        else {
            debug!("returned buffer matches no size class (capacity {}): discarding", buffer.capacity());
        }
    }
}
