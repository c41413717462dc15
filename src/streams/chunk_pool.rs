//! Reusable [`StreamChunk`] records.
//!
//! The fan-out path churns through one record per token. The pool keeps a
//! fixed-size LIFO of cleared records so steady-state traffic reuses
//! allocations instead of creating them. A delivered chunk is owned by the
//! consumer; only records that never leave the registry (undeliverable
//! sends, unknown stream ids) come back.

use parking_lot::Mutex;

use crate::{config::ChunkPoolingConfig, rpc::StreamChunk};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStats {
    pub size: usize,
    pub capacity: usize,
    pub created: u64,
    pub reused: u64,
}

impl PoolStats {
    pub fn reuse_rate(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

struct PoolInner {
    chunks: Vec<StreamChunk>,
    created: u64,
    reused: u64,
}

pub struct ChunkPool {
    enabled: bool,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl ChunkPool {
    pub fn new(config: &ChunkPoolingConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.pool_size,
            inner: Mutex::new(PoolInner {
                chunks: Vec::with_capacity(if config.enabled { config.pool_size } else { 0 }),
                created: 0,
                reused: 0,
            }),
        }
    }

    /// Hands out a cleared record, reusing a pooled one when available.
    pub fn acquire(&self) -> StreamChunk {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner.chunks.pop() {
            inner.reused += 1;
            chunk
        } else {
            inner.created += 1;
            StreamChunk::default()
        }
    }

    /// Clears a record and returns it to the pool, unless the pool is full
    /// or disabled.
    pub fn release(&self, mut chunk: StreamChunk) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.chunks.len() < self.capacity {
            chunk.token.clear();
            chunk.token_id = None;
            chunk.is_final = false;
            chunk.logprob = None;
            chunk.cumulative_text = None;
            inner.chunks.push(chunk);
        }
    }

    /// Drops every pooled record. Run periodically so a burst does not pin
    /// its peak allocation forever.
    pub fn clear(&self) {
        self.inner.lock().chunks.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            size: inner.chunks.len(),
            capacity: self.capacity,
            created: inner.created,
            reused: inner.reused,
        }
    }
}
