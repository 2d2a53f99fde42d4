//! Periodic trigger
//!
//! A one-shot timer that is re-armed by every handler execution. Firing only
//! requests a deferred execution through the device's work mailbox; it never
//! touches the device buffer or status.

use crate::record::DeviceStats;
use crate::timer::{TimerId, TimerService};
use common::{RequestOutcome, SessionId, Tick, WorkRequester};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Shared state captured by the timer callback
struct FireTarget {
    session: SessionId,
    requester: WorkRequester,
    stats: Arc<DeviceStats>,
    shut_down: AtomicBool,
}

impl FireTarget {
    /// Restricted-context body of a firing: one non-blocking request
    fn fire(&self) -> RequestOutcome {
        if self.shut_down.load(Ordering::Acquire) {
            return RequestOutcome::Closed;
        }

        self.stats.fired.fetch_add(1, Ordering::Relaxed);
        let outcome = self.requester.request();
        match outcome {
            RequestOutcome::Queued => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Coalesced => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Closed => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        trace!("{}: timer fired, work {:?}", self.session, outcome);
        outcome
    }
}

/// Recurring trigger bound to one device record
pub struct PeriodicTrigger {
    id: TimerId,
    timers: TimerService,
    period_ticks: u64,
    target: Arc<FireTarget>,
}

impl PeriodicTrigger {
    /// Register a disarmed trigger that requests work on `requester`
    pub(crate) fn new(
        timers: &TimerService,
        session: SessionId,
        requester: WorkRequester,
        period_ticks: u64,
        stats: Arc<DeviceStats>,
    ) -> Self {
        let target = Arc::new(FireTarget {
            session,
            requester,
            stats,
            shut_down: AtomicBool::new(false),
        });

        let callback_target = Arc::clone(&target);
        let id = timers.register(move || {
            callback_target.fire();
        });

        Self {
            id,
            timers: timers.clone(),
            period_ticks: period_ticks.max(1),
            target,
        }
    }

    /// Arm at `due`; re-arming an armed trigger only moves the due tick
    ///
    /// Returns `false` once the trigger has been shut down.
    pub fn arm_at(&self, due: Tick) -> bool {
        if self.target.shut_down.load(Ordering::Acquire) {
            return false;
        }
        self.timers.arm(self.id, due)
    }

    /// Arm `ticks` from now (at least one tick in the future)
    pub fn arm_after(&self, ticks: u64) -> bool {
        self.arm_at(self.timers.now().after(ticks.max(1)))
    }

    /// Arm one period from now
    pub fn rearm(&self) -> bool {
        self.arm_after(self.period_ticks)
    }

    /// Run the firing body directly, as the timer facility does at the due tick
    ///
    /// Never blocks. Does not change the armed state.
    pub fn fire(&self) -> RequestOutcome {
        self.target.fire()
    }

    /// Due tick while armed
    pub fn due(&self) -> Option<Tick> {
        self.timers.due(self.id)
    }

    pub fn is_armed(&self) -> bool {
        self.due().is_some()
    }

    pub fn period_ticks(&self) -> u64 {
        self.period_ticks
    }

    pub fn is_shut_down(&self) -> bool {
        self.target.shut_down.load(Ordering::Acquire)
    }

    /// Permanently disarm and wait out any firing in progress
    ///
    /// After this returns no firing can request work and arming is a no-op.
    pub fn shutdown_sync(&self) {
        if !self.target.shut_down.swap(true, Ordering::AcqRel) {
            self.timers.cancel_sync(self.id);
            debug!("{}: trigger shut down", self.target.session);
        }
    }
}

impl Drop for PeriodicTrigger {
    fn drop(&mut self) {
        self.shutdown_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ManualClock, create_work_mailbox};

    type Fixture = (
        Arc<ManualClock>,
        TimerService,
        PeriodicTrigger,
        common::WorkReceiver,
        Arc<DeviceStats>,
    );

    fn setup() -> Fixture {
        let clock = Arc::new(ManualClock::new(Tick(0)));
        let timers = TimerService::new(clock.clone());
        let (requester, receiver) = create_work_mailbox();
        let stats = Arc::new(DeviceStats::default());
        let trigger = PeriodicTrigger::new(&timers, SessionId(1), requester, 100, stats.clone());
        (clock, timers, trigger, receiver, stats)
    }

    #[test]
    fn test_initialized_disarmed() {
        let (_clock, _timers, trigger, _receiver, _stats) = setup();
        assert!(!trigger.is_armed());
        assert_eq!(trigger.period_ticks(), 100);
    }

    #[test]
    fn test_firing_requests_one_execution() {
        let (clock, timers, trigger, receiver, stats) = setup();

        assert!(trigger.arm_after(10));
        clock.advance(10);
        assert_eq!(timers.run_expired(), 1);

        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());
        assert_eq!(stats.snapshot().fired, 1);
        assert_eq!(stats.snapshot().queued, 1);
        assert!(!trigger.is_armed());
    }

    #[test]
    fn test_double_arm_single_execution() {
        let (clock, timers, trigger, receiver, _stats) = setup();

        assert!(trigger.arm_at(Tick(10)));
        assert!(trigger.arm_at(Tick(12)));
        assert_eq!(trigger.due(), Some(Tick(12)));

        clock.set(Tick(50));
        assert_eq!(timers.run_expired(), 1);
        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_rapid_firings_coalesce() {
        let (_clock, _timers, trigger, receiver, stats) = setup();

        assert_eq!(trigger.fire(), RequestOutcome::Queued);
        assert_eq!(trigger.fire(), RequestOutcome::Coalesced);

        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.fired, 2);
        assert_eq!(snapshot.coalesced, 1);
    }

    #[test]
    fn test_rearm_uses_period() {
        let (clock, _timers, trigger, _receiver, _stats) = setup();
        clock.set(Tick(1000));
        assert!(trigger.rearm());
        assert_eq!(trigger.due(), Some(Tick(1100)));
    }

    #[test]
    fn test_shutdown_is_permanent() {
        let (clock, timers, trigger, receiver, stats) = setup();

        trigger.arm_after(5);
        trigger.shutdown_sync();
        assert!(trigger.is_shut_down());
        assert!(!trigger.rearm());
        assert!(!trigger.is_armed());
        assert_eq!(trigger.fire(), RequestOutcome::Closed);

        clock.advance(1000);
        assert_eq!(timers.run_expired(), 0);
        assert!(receiver.try_recv().is_none());
        assert_eq!(stats.snapshot().fired, 0);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_drop_unregisters_timer() {
        let (_clock, timers, trigger, _receiver, _stats) = setup();
        assert_eq!(timers.len(), 1);
        drop(trigger);
        assert!(timers.is_empty());
    }
}
