use std::sync::{Arc, RwLock};

/// Concurrency and chunk-size hints supplied by an external rate adapter
/// (the heuristic mapping network conditions to these values lives
/// outside the engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// Files concurrently admitted into hashing/uploading.
    pub file_concurrency: usize,
    /// Chunk uploads concurrently in flight per file. The real resource
    /// ceiling is `file_concurrency * chunk_concurrency`.
    pub chunk_concurrency: usize,
    pub chunk_size: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            file_concurrency: 3,
            chunk_concurrency: 3,
            chunk_size: 5 * 1024 * 1024,
        }
    }
}

impl TransferLimits {
    /// Concurrency below 1 and a zero chunk size are never honored.
    pub fn clamped(self) -> Self {
        Self {
            file_concurrency: self.file_concurrency.max(1),
            chunk_concurrency: self.chunk_concurrency.max(1),
            chunk_size: self.chunk_size.max(1),
        }
    }
}

/// Shared cell the rate adapter pushes new limits into. Updates apply to
/// future scheduling decisions only; in-flight work is never cancelled by
/// a limit change.
#[derive(Clone)]
pub struct LimitHandle {
    inner: Arc<RwLock<TransferLimits>>,
}

impl LimitHandle {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(limits.clamped())),
        }
    }

    pub fn get(&self) -> TransferLimits {
        *self.inner.read().unwrap()
    }

    pub fn set(&self, limits: TransferLimits) {
        *self.inner.write().unwrap() = limits.clamped();
    }
}
