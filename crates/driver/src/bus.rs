//! Bus-side objects the driver is handed
//!
//! The bus owns one [`Session`] per device connection. The session carries a
//! shared handle to the device and a slot the driver publishes its record
//! into during attach and takes it back from during detach.
//!
//! [`SimulatedBus`] stands in for a real hot-plug bus: it creates sessions
//! for configured identities and calls the driver's attach/detach, the way a
//! device manager reacts to arrival and removal notifications.

use crate::driver::Driver;
use crate::error::{AttachError, DetachError};
use crate::record::DeviceRecord;
use common::{DeviceIdentity, SessionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Device as seen on the bus
#[derive(Debug)]
pub struct BusDevice {
    identity: DeviceIdentity,
    bus_number: u8,
    address: u8,
}

impl BusDevice {
    pub fn new(identity: DeviceIdentity, bus_number: u8, address: u8) -> Self {
        Self {
            identity,
            bus_number,
            address,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

/// Shared ownership handle to a bus device; the device lives until the last
/// handle drops
pub type DeviceHandle = Arc<BusDevice>;

/// One device connection, with the per-session slot for driver data
pub struct Session {
    id: SessionId,
    device: DeviceHandle,
    slot: Mutex<Option<DeviceRecord>>,
}

impl Session {
    pub fn new(id: SessionId, device: DeviceHandle) -> Self {
        Self {
            id,
            device,
            slot: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Whether a driver record is published in the slot
    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Run `f` against the published record, if any
    ///
    /// The slot is locked for the duration of `f`; attach and detach on this
    /// session wait until it returns.
    pub fn with_record<R>(&self, f: impl FnOnce(&DeviceRecord) -> R) -> Option<R> {
        self.slot.lock().as_ref().map(f)
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, Option<DeviceRecord>> {
        self.slot.lock()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// In-process bus that plugs and unplugs devices on a driver
pub struct SimulatedBus {
    driver: Arc<Driver>,
    sessions: HashMap<SessionId, Arc<Session>>,
    next_session: u32,
    next_address: u8,
}

impl SimulatedBus {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            sessions: HashMap::new(),
            next_session: 1,
            next_address: 1,
        }
    }

    /// Connect a device and let the driver attach to it
    ///
    /// The session stays on the bus even if attach fails, as an unclaimed
    /// device would.
    pub fn plug(&mut self, identity: DeviceIdentity) -> (SessionId, Result<(), AttachError>) {
        let id = SessionId(self.next_session);
        self.next_session += 1;

        let address = self.next_address;
        self.next_address = self.next_address.checked_add(1).unwrap_or(1);

        let device = Arc::new(BusDevice::new(identity, 1, address));
        let session = Arc::new(Session::new(id, device));
        self.sessions.insert(id, Arc::clone(&session));

        debug!("Device {} arrived as {}", identity, id);
        let result = self.driver.attach(&session, &identity);
        if let Err(e) = &result {
            warn!("Driver did not attach to {} ({}): {}", id, identity, e);
        }
        (id, result)
    }

    /// Disconnect a device; the driver detaches if it was attached
    pub fn unplug(&mut self, id: SessionId) -> Option<Result<(), DetachError>> {
        let session = self.sessions.remove(&id)?;
        debug!("Device left: {}", id);

        if !session.is_bound() {
            return Some(Ok(()));
        }

        let result = self.driver.detach(&session);
        match &result {
            Ok(()) => info!("{} removed", id),
            Err(e) => warn!("Detach of {} failed: {}", id, e),
        }
        Some(result)
    }

    /// Disconnect every device
    pub fn unplug_all(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.unplug(id))
            .count()
    }

    pub fn session(&self, id: SessionId) -> Option<&Arc<Session>> {
        self.sessions.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }
}
