//! Buffer reuse pool for computed values and gradients

use std::collections::HashMap;
use std::sync::Arc;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::config::get_config;
use crate::tensor::{Matrix, Shape};

/// Allocation service injected into graphs. Released buffers may be handed out
/// again by a later `acquire` of the same size.
pub trait MemoryPool: Send + Sync {
    /// A zero-filled matrix of the given shape.
    fn acquire(&self, shape: Shape) -> Matrix;
    /// Return a matrix's buffer for reuse.
    fn release(&self, matrix: Matrix);
    fn stats(&self) -> PoolStats;
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total `acquire` calls
    pub acquired: usize,
    /// `acquire` calls served from a pooled buffer
    pub reused: usize,
    /// Total `release` calls
    pub released: usize,
    /// Buffers currently sitting in the free lists
    pub pooled: usize,
}

/// Free lists partitioned by element count, guarded by a single lock.
pub struct BufferPool {
    pools: Mutex<HashMap<usize, Vec<Vec<f32>>>>,
    stats: Mutex<PoolStats>,
    max_buffers_per_size: usize,
}

impl BufferPool {
    pub fn new(max_buffers_per_size: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
            max_buffers_per_size,
        }
    }

    /// Drop every pooled buffer.
    pub fn clear_pools(&self) {
        let mut pools = self.pools.lock();
        pools.clear();
        self.stats.lock().pooled = 0;
    }
}

impl MemoryPool for BufferPool {
    fn acquire(&self, shape: Shape) -> Matrix {
        let size = shape.total_elements();
        let mut pools = self.pools.lock();
        let buffer = pools.get_mut(&size).and_then(|pool| pool.pop());

        let mut stats = self.stats.lock();
        stats.acquired += 1;
        match buffer {
            Some(buffer) => {
                stats.reused += 1;
                stats.pooled -= 1;
                Matrix::from_buffer(shape, buffer)
            }
            None => Matrix::zeros(shape),
        }
    }

    fn release(&self, matrix: Matrix) {
        let buffer = matrix.into_buffer();
        let size = buffer.len();

        let mut pools = self.pools.lock();
        let mut stats = self.stats.lock();
        stats.released += 1;

        let pool = pools.entry(size).or_insert_with(Vec::new);
        if pool.len() < self.max_buffers_per_size {
            pool.push(buffer);
            stats.pooled += 1;
        }
    }

    fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }
}

lazy_static! {
    static ref DEFAULT_POOL: Arc<BufferPool> =
        Arc::new(BufferPool::new(get_config().memory.max_buffers_per_size));
}

/// Process-wide pool shared by graphs that were not given their own.
pub fn default_pool() -> Arc<dyn MemoryPool> {
    DEFAULT_POOL.clone()
}
