//! Test utilities for the timer driver
//!
//! Provides mock identities, an instrumented memory pool and polling helpers
//! for tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_identity, CountingPool};
//!
//! # fn main() {
//! let identity = create_mock_identity(1);
//! assert_eq!(identity.vendor_id, 0x1234);
//!
//! let pool = CountingPool::new();
//! assert_eq!(pool.outstanding(), 0);
//! # }
//! ```

use crate::device_types::DeviceIdentity;
use crate::pool::{AllocationKind, MemoryPool};
use crate::{Error, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor ID used by mock identities (matches the driver's default id table)
pub const MOCK_VENDOR_ID: u16 = 0x1234;

/// Product ID used by mock identities (matches the driver's default id table)
pub const MOCK_PRODUCT_ID: u16 = 0x5678;

/// Create a mock identity the default id table accepts
///
/// `id` is accepted for symmetry with [`create_mock_identity_list`]; every
/// returned identity is `1234:5678`.
pub fn create_mock_identity(_id: u32) -> DeviceIdentity {
    DeviceIdentity::new(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
}

/// Create an identity no default id table accepts
pub fn create_unknown_identity() -> DeviceIdentity {
    DeviceIdentity::new(0xDEAD, 0xBEEF)
}

/// Create a list of distinct mock identities
///
/// # Example
/// ```
/// use common::test_utils::create_mock_identity_list;
///
/// let identities = create_mock_identity_list(5);
/// assert_eq!(identities.len(), 5);
/// ```
pub fn create_mock_identity_list(count: u16) -> Vec<DeviceIdentity> {
    (1..=count)
        .map(|i| DeviceIdentity::new(0x1000 + i, 0x2000 + i))
        .collect()
}

/// Memory pool that counts allocations and can be told to refuse one
///
/// `outstanding()` returning zero means every reserve was matched by a
/// release.
#[derive(Debug, Default)]
pub struct CountingPool {
    reserves: AtomicUsize,
    releases: AtomicUsize,
    outstanding_bytes: AtomicUsize,
    fail_on: Mutex<Option<AllocationKind>>,
}

impl CountingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that refuses every reservation of `kind`
    pub fn failing_on(kind: AllocationKind) -> Self {
        let pool = Self::new();
        pool.fail_on(Some(kind));
        pool
    }

    /// Change which allocation kind is refused (`None` refuses nothing)
    pub fn fail_on(&self, kind: Option<AllocationKind>) {
        if let Ok(mut fail_on) = self.fail_on.lock() {
            *fail_on = kind;
        }
    }

    /// Successful reservations so far
    pub fn reserves(&self) -> usize {
        self.reserves.load(Ordering::SeqCst)
    }

    /// Releases so far
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Reservations not yet released
    pub fn outstanding(&self) -> usize {
        self.reserves().saturating_sub(self.releases())
    }

    /// Bytes not yet released
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::SeqCst)
    }
}

impl MemoryPool for CountingPool {
    fn reserve(&self, kind: AllocationKind, bytes: usize) -> Result<()> {
        let refused = self
            .fail_on
            .lock()
            .map(|fail_on| *fail_on == Some(kind))
            .unwrap_or(false);
        if refused {
            return Err(Error::OutOfMemory { requested: bytes });
        }

        self.reserves.fetch_add(1, Ordering::SeqCst);
        self.outstanding_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _kind: AllocationKind, bytes: usize) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.outstanding_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed to hold.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
