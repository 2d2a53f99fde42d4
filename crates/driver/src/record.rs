//! Per-device state
//!
//! The [`DeviceRecord`] is what attach publishes into a session slot. Its
//! data buffer is not reachable from the record: the buffer is moved into
//! the device's deferred worker, which is the only code allowed to mutate
//! it, and comes back to the record only when detach has joined the worker.

use crate::bus::DeviceHandle;
use crate::error::DetachError;
use crate::trigger::PeriodicTrigger;
use crate::work::DeferredWork;
use common::{Allocation, AllocationKind, MemoryPool, SessionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Device status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceStatus {
    /// Attached, no handler execution completed yet
    Idle = 0,
    /// At least one handler execution completed
    Active = 1,
}

impl DeviceStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceStatus::Idle,
            _ => DeviceStatus::Active,
        }
    }

    /// Integer status code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Status cell: written by the deferred handler, read anywhere
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: DeviceStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> DeviceStatus {
        DeviceStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: DeviceStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Fixed-capacity data buffer charged to a memory pool
#[derive(Debug)]
pub struct DeviceBuffer {
    bytes: Vec<u8>,
    _allocation: Allocation,
}

impl DeviceBuffer {
    /// Allocate a zero-filled buffer of exactly `capacity` bytes
    ///
    /// Fails with [`common::Error::OutOfMemory`] if either the pool or the
    /// system allocator refuses; nothing stays charged on failure.
    pub fn allocate(pool: &Arc<dyn MemoryPool>, capacity: usize) -> common::Result<Self> {
        let allocation = Allocation::acquire(pool, AllocationKind::Buffer, capacity)?;
        let bytes = common::pool::try_alloc_zeroed(capacity)?;
        Ok(Self {
            bytes,
            _allocation: allocation,
        })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view for transfer code filling the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Reset every byte to the zero baseline
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

/// Per-device counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub(crate) fired: AtomicU64,
    pub(crate) queued: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) started: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) buffer_clears: AtomicU64,
    pub(crate) faults: AtomicU64,
}

impl DeviceStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fired: self.fired.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            coalesced: self.coalesced.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            buffer_clears: self.buffer_clears.load(Ordering::SeqCst),
            faults: self.faults.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Trigger firings
    pub fired: u64,
    /// Firings that queued a new execution
    pub queued: u64,
    /// Firings merged into an already pending execution
    pub coalesced: u64,
    /// Firings that found the mailbox closed
    pub rejected: u64,
    /// Handler executions started
    pub started: u64,
    /// Handler executions completed
    pub completed: u64,
    /// Buffer clears performed
    pub buffer_clears: u64,
    /// Executions that hit a handler fault
    pub faults: u64,
}

/// State container for one attached device
///
/// Fields drop in declaration order, so a record dropped without
/// [`DeviceRecord::teardown`] still stops its worker before the device
/// reference and the record allocation are released.
pub struct DeviceRecord {
    trigger: Arc<PeriodicTrigger>,
    work: DeferredWork,
    device: DeviceHandle,
    session: SessionId,
    status: Arc<StatusCell>,
    stats: Arc<DeviceStats>,
    buffer_capacity: usize,
    allocation: Allocation,
}

impl DeviceRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        allocation: Allocation,
        device: DeviceHandle,
        session: SessionId,
        buffer_capacity: usize,
        status: Arc<StatusCell>,
        stats: Arc<DeviceStats>,
        trigger: Arc<PeriodicTrigger>,
        work: DeferredWork,
    ) -> Self {
        Self {
            trigger,
            work,
            device,
            session,
            status,
            stats,
            buffer_capacity,
            allocation,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn trigger(&self) -> &PeriodicTrigger {
        &self.trigger
    }

    /// Release everything the record owns
    ///
    /// Order: cancel the trigger, close the work mailbox and wait for the
    /// worker (a pending execution still runs), drop the device reference,
    /// free the buffer, free the record.
    pub(crate) fn teardown(self) -> Result<StatsSnapshot, DetachError> {
        let DeviceRecord {
            trigger,
            work,
            device,
            session,
            status: _,
            stats,
            buffer_capacity: _,
            allocation,
        } = self;

        trigger.shutdown_sync();
        debug!("{}: trigger disarmed", session);

        let joined = work.close_and_wait();
        debug!("{}: deferred work drained", session);

        drop(device);

        let result = match joined {
            Ok(state) => {
                drop(state.into_buffer());
                Ok(stats.snapshot())
            }
            Err(e) => {
                warn!("{}: {}", session, e);
                Err(e)
            }
        };

        drop(allocation);
        info!("{}: device record released", session);
        result
    }
}
