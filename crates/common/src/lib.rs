//! Common utilities for the USB timer driver
//!
//! This crate provides the platform services the driver core consumes:
//! a monotonic tick clock, the coalescing work mailbox used for the
//! timer-to-worker handoff, allocation accounting, device identity types,
//! error handling and logging setup.

pub mod channel;
pub mod clock;
pub mod device_types;
pub mod error;
pub mod logging;
pub mod pool;
pub mod test_utils;

pub use channel::{RequestOutcome, WorkReceiver, WorkRequester, create_work_mailbox};
pub use clock::{Clock, ManualClock, MonotonicClock, TICKS_PER_SEC, Tick};
pub use device_types::{DeviceIdTable, DeviceIdentity, IdFilter, SessionId};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pool::{Allocation, AllocationKind, LimitedPool, MemoryPool, SystemPool};
