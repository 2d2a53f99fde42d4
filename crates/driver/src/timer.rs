//! Platform timer facility
//!
//! One-shot timers keyed by [`TimerId`]. A timer is registered disarmed with
//! a callback, armed at a [`Tick`], and fires once when the clock reaches the
//! due tick; it stays disarmed until armed again.
//!
//! Callbacks run with the timer table locked. They execute in the restricted
//! context: they must not block, allocate, or call back into the service.
//! Because firing holds the table lock, [`TimerService::cancel_sync`]
//! returning means no firing of that timer is in progress and none can
//! start afterwards.
//!
//! The service is driven either by a background thread ([`TimerService::start`])
//! that sleeps until the earliest due tick, or manually through
//! [`TimerService::run_expired`] (tests and simulation with a manual clock).

use common::{Clock, Tick};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Upper bound on how long the timer thread sleeps when nothing is armed
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Identifier of a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn Fn() + Send + Sync>;

struct TimerEntry {
    due: Option<Tick>,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerTable {
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
    running: bool,
}

impl TimerTable {
    fn next_due(&self) -> Option<Tick> {
        self.entries.values().filter_map(|e| e.due).min()
    }

    /// Fire every armed timer due at or before `now`
    fn fire_expired(&mut self, now: Tick) -> usize {
        let mut fired = 0;
        for (id, entry) in self.entries.iter_mut() {
            if entry.due.is_some_and(|due| due <= now) {
                entry.due = None;
                trace!("Timer {:?} fired at {:?}", id, now);
                (entry.callback)();
                fired += 1;
            }
        }
        fired
    }
}

struct TimerInner {
    clock: Arc<dyn Clock>,
    table: Mutex<TimerTable>,
    wakeup: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the timer facility
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerInner>,
}

impl TimerService {
    /// Create a timer service reading time from `clock`
    ///
    /// No thread is started; call [`TimerService::start`] for background
    /// firing or drive it with [`TimerService::run_expired`].
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                clock,
                table: Mutex::new(TimerTable::default()),
                wakeup: Condvar::new(),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Current tick of the service's clock
    pub fn now(&self) -> Tick {
        self.inner.clock.now()
    }

    /// Register a disarmed timer that runs `callback` when it fires
    pub fn register<F>(&self, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut table = self.inner.table.lock();
        let id = TimerId(table.next_id);
        table.next_id += 1;
        table.entries.insert(
            id,
            TimerEntry {
                due: None,
                callback: Box::new(callback),
            },
        );
        debug!("Registered timer {:?}", id);
        id
    }

    /// Arm (or re-arm) a timer at `due`
    ///
    /// Re-arming an armed timer only moves its due tick. Returns `false` if
    /// the timer was cancelled.
    pub fn arm(&self, id: TimerId, due: Tick) -> bool {
        let mut table = self.inner.table.lock();
        match table.entries.get_mut(&id) {
            Some(entry) => {
                entry.due = Some(due);
                trace!("Timer {:?} armed for {:?}", id, due);
                self.inner.wakeup.notify_one();
                true
            }
            None => false,
        }
    }

    /// Disarm a timer without unregistering it
    pub fn disarm(&self, id: TimerId) -> bool {
        let mut table = self.inner.table.lock();
        match table.entries.get_mut(&id) {
            Some(entry) => {
                entry.due = None;
                true
            }
            None => false,
        }
    }

    /// Permanently remove a timer, waiting out any firing in progress
    ///
    /// Returns `false` if the timer was already cancelled.
    pub fn cancel_sync(&self, id: TimerId) -> bool {
        let removed = self.inner.table.lock().entries.remove(&id).is_some();
        if removed {
            debug!("Cancelled timer {:?}", id);
        }
        removed
    }

    /// Due tick of an armed timer
    pub fn due(&self, id: TimerId) -> Option<Tick> {
        self.inner
            .table
            .lock()
            .entries
            .get(&id)
            .and_then(|entry| entry.due)
    }

    pub fn is_registered(&self, id: TimerId) -> bool {
        self.inner.table.lock().entries.contains_key(&id)
    }

    /// Number of registered timers
    pub fn len(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every timer due at the clock's current tick
    ///
    /// Returns the number of timers fired.
    pub fn run_expired(&self) -> usize {
        let now = self.now();
        self.inner.table.lock().fire_expired(now)
    }

    /// Start the background firing thread
    ///
    /// Starting an already running service is a no-op.
    pub fn start(&self) -> common::Result<()> {
        let mut thread = self.inner.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.inner.table.lock().running = true;
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("timer-service".to_string())
            .spawn(move || run_timer_thread(inner))
            .inspect_err(|_| self.inner.table.lock().running = false)?;

        *thread = Some(handle);
        Ok(())
    }

    /// Stop the background firing thread and wait for it to exit
    pub fn stop(&self) {
        let Some(handle) = self.inner.thread.lock().take() else {
            return;
        };

        self.inner.table.lock().running = false;
        self.inner.wakeup.notify_all();

        if handle.join().is_err() {
            warn!("Timer thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.thread.lock().is_some()
    }
}

/// Background loop: fire expired timers, then sleep until the next due tick
fn run_timer_thread(inner: Arc<TimerInner>) {
    info!("Timer thread started");

    let mut table = inner.table.lock();
    while table.running {
        let now = inner.clock.now();
        table.fire_expired(now);

        let wait = match table.next_due() {
            Some(due) => due
                .duration_since(inner.clock.now())
                .clamp(Duration::from_millis(1), IDLE_WAIT),
            None => IDLE_WAIT,
        };
        inner.wakeup.wait_for(&mut table, wait);
    }

    info!("Timer thread stopped");
}
