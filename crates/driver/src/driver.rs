//! Lifecycle controller
//!
//! [`Driver`] is the explicit context object that replaces module-level
//! registration: it is started and stopped, holds the id table, the timer
//! facility and the memory pool, and implements the bus callbacks
//! [`Driver::attach`] and [`Driver::detach`].
//!
//! # Attach
//!
//! The record is built completely before it becomes visible: record
//! allocation, buffer allocation, device reference, status, work mailbox,
//! disarmed trigger, worker thread. Only then is it published into the
//! session slot, and the trigger is armed last, so a firing can never see a
//! partially built record. Any failure before publication unwinds what was
//! acquired, in reverse order.
//!
//! # Detach
//!
//! The record is taken out of the slot, then torn down: the trigger is
//! cancelled synchronously, the work mailbox is closed and the worker joined
//! (a pending execution still runs to completion), and only then are the
//! device reference, buffer and record released.

use crate::bus::Session;
use crate::error::{AttachError, DetachError};
use crate::record::{DeviceBuffer, DeviceRecord, DeviceStats, DeviceStatus, StatusCell};
use crate::timer::TimerService;
use crate::trigger::PeriodicTrigger;
use crate::work::{DeferredWork, ExecutionObserver, HandlerState, NoopObserver};
use common::{
    Allocation, AllocationKind, Clock, DeviceIdTable, DeviceIdentity, IdFilter, MemoryPool,
    MonotonicClock, SessionId, SystemPool, Tick, create_work_mailbox,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default data buffer capacity in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default re-arm period of the trigger
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Default delay before the first firing after attach
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default vendor ID served by the driver
pub const DEFAULT_VENDOR_ID: u16 = 0x1234;

/// Default product ID served by the driver
pub const DEFAULT_PRODUCT_ID: u16 = 0x5678;

/// Bytes charged to the memory pool for a device record
pub const RECORD_CHARGE: usize = std::mem::size_of::<DeviceRecord>();

/// Bytes charged to the memory pool for one attached device
pub fn per_device_charge(buffer_size: usize) -> usize {
    RECORD_CHARGE.saturating_add(buffer_size)
}

/// Driver parameters
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Driver name used in logs
    pub name: String,
    /// Trigger period; each handler execution re-arms this far ahead
    pub period: Duration,
    /// Delay from attach to the first firing
    pub initial_delay: Duration,
    /// Data buffer capacity per device
    pub buffer_size: usize,
    /// Identities the driver binds to
    pub id_table: DeviceIdTable,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: "usb_timer_driver".to_string(),
            period: DEFAULT_PERIOD,
            initial_delay: DEFAULT_INITIAL_DELAY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            id_table: DeviceIdTable::new(vec![IdFilter::exact(
                DEFAULT_VENDOR_ID,
                DEFAULT_PRODUCT_ID,
            )]),
        }
    }
}

/// How the timer facility is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// A background thread fires timers in real time
    Background,
    /// The owner calls [`TimerService::run_expired`]
    Manual,
}

/// Builder for [`Driver`]
pub struct DriverBuilder {
    settings: DriverSettings,
    clock: Option<Arc<dyn Clock>>,
    pool: Option<Arc<dyn MemoryPool>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    timer_mode: TimerMode,
}

impl DriverBuilder {
    /// Clock for due times (default: [`MonotonicClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Pool charged for records and buffers (default: [`SystemPool`])
    pub fn pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Hooks around handler executions (default: [`NoopObserver`])
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Timer driving mode (default: [`TimerMode::Background`])
    pub fn timer_mode(mut self, mode: TimerMode) -> Self {
        self.timer_mode = mode;
        self
    }

    pub fn build(self) -> Driver {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        Driver {
            timers: TimerService::new(Arc::clone(&clock)),
            clock,
            pool: self.pool.unwrap_or_else(|| Arc::new(SystemPool)),
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            timer_mode: self.timer_mode,
            settings: self.settings,
            state: Mutex::new(DriverState::default()),
        }
    }
}

#[derive(Default)]
struct DriverState {
    registered: bool,
    bound: HashMap<SessionId, Arc<Session>>,
}

/// Driver context: registration state plus the attach/detach callbacks
pub struct Driver {
    settings: DriverSettings,
    clock: Arc<dyn Clock>,
    timers: TimerService,
    pool: Arc<dyn MemoryPool>,
    observer: Arc<dyn ExecutionObserver>,
    timer_mode: TimerMode,
    state: Mutex<DriverState>,
}

impl Driver {
    pub fn builder(settings: DriverSettings) -> DriverBuilder {
        DriverBuilder {
            settings,
            clock: None,
            pool: None,
            observer: None,
            timer_mode: TimerMode::Background,
        }
    }

    /// Register the driver so the bus may attach devices to it
    ///
    /// Starts the timer thread in [`TimerMode::Background`]. Starting a
    /// registered driver is a no-op.
    pub fn start(&self) -> common::Result<()> {
        let mut state = self.state.lock();
        if state.registered {
            return Ok(());
        }

        if self.timer_mode == TimerMode::Background {
            self.timers.start()?;
        }
        state.registered = true;

        info!(
            "Loading driver {} (period {:?}, buffer {} bytes)",
            self.settings.name, self.settings.period, self.settings.buffer_size
        );
        Ok(())
    }

    /// Deregister the driver, detaching every device still bound to it
    ///
    /// Returns the number of devices detached.
    pub fn stop(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.lock();
            if !state.registered {
                return 0;
            }
            state.registered = false;
            state.bound.drain().map(|(_, session)| session).collect()
        };

        info!("Unloading driver {}", self.settings.name);

        let mut detached = 0;
        for session in sessions {
            match self.detach(&session) {
                Ok(()) => detached += 1,
                Err(DetachError::NotAttached) => {}
                Err(e) => warn!("Detach of {} during unload failed: {}", session.id(), e),
            }
        }

        if self.timer_mode == TimerMode::Background {
            self.timers.stop();
        }
        detached
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Attach callback: build and publish the record for `session`
    pub fn attach(
        &self,
        session: &Arc<Session>,
        identity: &DeviceIdentity,
    ) -> Result<(), AttachError> {
        info!("USB device connected: {} on {}", identity, session.id());

        if !self.is_registered() {
            return Err(AttachError::DriverStopped);
        }
        if !self.settings.id_table.matches(identity) {
            debug!("{} not in id table of {}", identity, self.settings.name);
            return Err(AttachError::NoMatch {
                identity: *identity,
            });
        }

        let mut slot = session.lock_slot();
        if slot.is_some() {
            warn!("{} already has a device record", session.id());
            return Err(AttachError::AlreadyAttached);
        }

        // Everything below unwinds in reverse order on an early return
        let allocation = Allocation::acquire(&self.pool, AllocationKind::Record, RECORD_CHARGE)?;
        let buffer = DeviceBuffer::allocate(&self.pool, self.settings.buffer_size)?;
        let device = Arc::clone(session.device());
        let status = Arc::new(StatusCell::new(DeviceStatus::Idle));
        let stats = Arc::new(DeviceStats::default());

        let (requester, receiver) = create_work_mailbox();
        let trigger = Arc::new(PeriodicTrigger::new(
            &self.timers,
            session.id(),
            requester.clone(),
            self.period_ticks(),
            Arc::clone(&stats),
        ));

        let state = HandlerState::new(
            session.id(),
            buffer,
            Arc::clone(&status),
            Arc::clone(&stats),
            Arc::clone(&trigger),
            Arc::clone(&self.observer),
        );
        let work =
            DeferredWork::spawn(state, requester, receiver).map_err(AttachError::WorkerSpawn)?;

        let record = DeviceRecord::new(
            allocation,
            device,
            session.id(),
            self.settings.buffer_size,
            status,
            stats,
            Arc::clone(&trigger),
            work,
        );

        if !self.bind(session) {
            return Err(AttachError::DriverStopped);
        }
        *slot = Some(record);

        let due = self.clock.now().after(self.initial_delay_ticks());
        trigger.arm_at(due);
        drop(slot);

        info!("{}: device initialized, first firing at {:?}", session.id(), due);
        Ok(())
    }

    /// Detach callback: tear down the record of `session`
    ///
    /// Does not return while a handler execution for the device could still
    /// be running.
    pub fn detach(&self, session: &Session) -> Result<(), DetachError> {
        info!("USB device disconnected: {}", session.id());

        let record = session
            .lock_slot()
            .take()
            .ok_or(DetachError::NotAttached)?;
        self.unbind(session.id());

        let stats = record.teardown()?;
        info!(
            "{}: detached after {} handler executions ({} firings, {} coalesced)",
            session.id(),
            stats.completed,
            stats.fired,
            stats.coalesced
        );
        Ok(())
    }

    fn bind(&self, session: &Arc<Session>) -> bool {
        let mut state = self.state.lock();
        if !state.registered {
            return false;
        }
        state.bound.insert(session.id(), Arc::clone(session));
        true
    }

    fn unbind(&self, id: SessionId) {
        self.state.lock().bound.remove(&id);
    }

    /// Number of sessions with a published record
    pub fn bound_count(&self) -> usize {
        self.state.lock().bound.len()
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn period_ticks(&self) -> u64 {
        Tick::ticks_in(self.settings.period).max(1)
    }

    pub fn initial_delay_ticks(&self) -> u64 {
        Tick::ticks_in(self.settings.initial_delay).max(1)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}
