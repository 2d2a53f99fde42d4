//! Driver lifecycle error types

use common::DeviceIdentity;
use thiserror::Error;

/// Attach failure; the device is treated as never attached
#[derive(Debug, Error)]
pub enum AttachError {
    /// Record or buffer allocation was refused
    #[error("Out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },

    /// The session already holds a device record
    #[error("Session already has an attached device")]
    AlreadyAttached,

    /// The device is not in the driver's id table
    #[error("Device {identity} does not match the driver id table")]
    NoMatch { identity: DeviceIdentity },

    /// The driver is not registered (never started, or stopped)
    #[error("Driver is not registered")]
    DriverStopped,

    /// The deferred worker could not be started
    #[error("Failed to spawn deferred worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A platform service other than the memory pool failed
    #[error("Platform service failed: {0}")]
    Platform(#[source] common::Error),
}

impl From<common::Error> for AttachError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::OutOfMemory { requested } => AttachError::OutOfMemory { requested },
            other => AttachError::Platform(other),
        }
    }
}

/// Detach failure; detach is one-shot and never retried
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetachError {
    /// The session holds no device record
    #[error("No device attached to session")]
    NotAttached,

    /// The deferred worker panicked; remaining resources were still released
    #[error("Deferred worker panicked before teardown completed")]
    WorkerPanicked,
}

/// Fault observed inside a handler execution; absorbed and logged, never propagated
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFault {
    /// The record's buffer is gone; the execution must not touch it or re-arm
    #[error("Device record already torn down")]
    RecordAlreadyTornDown,
}
