//! USB timer driver core
//!
//! Coordinates a periodic trigger firing in a restricted context with a
//! deferred handler running on a blocking worker, across attach and detach
//! of the device the two operate on.
//!
//! ```text
//! attach ──► record built ──► published in session slot ──► trigger armed
//!                                                               │
//!            ┌──────────────── re-arm ◄─────── handler ◄── mailbox (cap 1)
//!            ▼                                                  ▲
//!         trigger fires (timer thread) ── try_send ─────────────┘
//!
//! detach ──► trigger cancelled ──► mailbox closed, worker joined
//!        ──► device reference, buffer, record released
//! ```

pub mod bus;
pub mod config;
pub mod driver;
pub mod error;
pub mod record;
pub mod timer;
pub mod trigger;
pub mod work;

pub use bus::{BusDevice, DeviceHandle, Session, SimulatedBus};
pub use driver::{Driver, DriverBuilder, DriverSettings, TimerMode};
pub use error::{AttachError, DetachError, HandlerFault};
pub use record::{DeviceBuffer, DeviceRecord, DeviceStatus, StatsSnapshot};
pub use timer::{TimerId, TimerService};
pub use trigger::PeriodicTrigger;
pub use work::{ExecutionObserver, ExecutionOutcome, NoopObserver};
