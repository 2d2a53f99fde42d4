//! Memory accounting for driver allocations
//!
//! Every per-device allocation is charged to a [`MemoryPool`] and held as an
//! [`Allocation`] guard. Dropping the guard returns the bytes to the pool, so
//! an unwinding attach can release partial work simply by dropping guards in
//! reverse order.

use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// The per-device record itself
    Record,
    /// The per-device data buffer
    Buffer,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationKind::Record => write!(f, "record"),
            AllocationKind::Buffer => write!(f, "buffer"),
        }
    }
}

/// Allocation facility that may refuse a request
pub trait MemoryPool: Send + Sync + 'static {
    /// Charge `bytes` to the pool, failing with [`Error::OutOfMemory`]
    fn reserve(&self, kind: AllocationKind, bytes: usize) -> Result<()>;

    /// Return `bytes` previously charged with [`MemoryPool::reserve`]
    fn release(&self, kind: AllocationKind, bytes: usize);
}

/// RAII guard for bytes charged to a pool
pub struct Allocation {
    pool: Arc<dyn MemoryPool>,
    kind: AllocationKind,
    bytes: usize,
}

impl Allocation {
    /// Charge `bytes` of `kind` to `pool`
    pub fn acquire(pool: &Arc<dyn MemoryPool>, kind: AllocationKind, bytes: usize) -> Result<Self> {
        pool.reserve(kind, bytes)?;
        trace!("Reserved {} bytes for {}", bytes, kind);
        Ok(Self {
            pool: Arc::clone(pool),
            kind,
            bytes,
        })
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.pool.release(self.kind, self.bytes);
        trace!("Released {} bytes for {}", self.bytes, self.kind);
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("kind", &self.kind)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Pool with no accounting limit; only the real allocator can refuse
#[derive(Debug, Default)]
pub struct SystemPool;

impl MemoryPool for SystemPool {
    fn reserve(&self, _kind: AllocationKind, _bytes: usize) -> Result<()> {
        Ok(())
    }

    fn release(&self, _kind: AllocationKind, _bytes: usize) {}
}

/// Pool with a fixed byte budget shared by all devices of a driver
#[derive(Debug)]
pub struct LimitedPool {
    limit: usize,
    used: AtomicUsize,
}

impl LimitedPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently charged
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl MemoryPool for LimitedPool {
    fn reserve(&self, _kind: AllocationKind, bytes: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory { requested: bytes })
    }

    fn release(&self, _kind: AllocationKind, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Allocate a zero-filled byte vector of exactly `capacity` bytes, mapping
/// allocator refusal to [`Error::OutOfMemory`]
pub fn try_alloc_zeroed(capacity: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(capacity)
        .map_err(|_| Error::OutOfMemory {
            requested: capacity,
        })?;
    bytes.resize(capacity, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_pool_budget() {
        let limited = Arc::new(LimitedPool::new(100));
        let pool: Arc<dyn MemoryPool> = limited.clone();

        let a = Allocation::acquire(&pool, AllocationKind::Record, 60).unwrap();
        assert_eq!(limited.used(), 60);

        let err = Allocation::acquire(&pool, AllocationKind::Buffer, 50).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { requested: 50 }));
        assert_eq!(limited.used(), 60);

        drop(a);
        assert_eq!(limited.used(), 0);

        let _b = Allocation::acquire(&pool, AllocationKind::Buffer, 100).unwrap();
        assert_eq!(limited.used(), 100);
    }

    #[test]
    fn test_system_pool_never_refuses() {
        let pool: Arc<dyn MemoryPool> = Arc::new(SystemPool);
        let alloc = Allocation::acquire(&pool, AllocationKind::Buffer, usize::MAX).unwrap();
        assert_eq!(alloc.bytes(), usize::MAX);
        assert_eq!(alloc.kind(), AllocationKind::Buffer);
    }

    #[test]
    fn test_try_alloc_zeroed() {
        let bytes = try_alloc_zeroed(4096).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert!(bytes.iter().all(|b| *b == 0));

        assert!(matches!(
            try_alloc_zeroed(usize::MAX),
            Err(Error::OutOfMemory { .. })
        ));
    }
}
