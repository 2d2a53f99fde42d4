//! Attach/detach lifecycle tests across the trigger, the deferred handler
//! and the teardown barrier

use common::test_utils::{
    CountingPool, DEFAULT_TEST_TIMEOUT, create_mock_identity, create_unknown_identity, wait_until,
};
use common::{
    AllocationKind, DeviceIdTable, DeviceIdentity, LimitedPool, ManualClock, RequestOutcome,
    SessionId, Tick,
};
use driver::driver::per_device_charge;
use driver::{
    AttachError, BusDevice, DetachError, DeviceStatus, Driver, DriverSettings,
    ExecutionObserver, ExecutionOutcome, Session, SimulatedBus, TimerMode,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Observer that can hold executions at their start until released
#[derive(Default)]
struct GatedObserver {
    closed: Mutex<bool>,
    opened: Condvar,
    started: AtomicUsize,
    finished: AtomicUsize,
    statuses: Mutex<Vec<DeviceStatus>>,
}

impl GatedObserver {
    fn closed() -> Arc<Self> {
        let observer = Self::default();
        *observer.closed.lock() = true;
        Arc::new(observer)
    }

    fn release(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ExecutionObserver for GatedObserver {
    fn execution_started(&self, _session: SessionId, status: DeviceStatus) {
        self.statuses.lock().push(status);
        self.started.fetch_add(1, Ordering::SeqCst);

        let mut closed = self.closed.lock();
        while *closed {
            self.opened.wait(&mut closed);
        }
    }

    fn execution_finished(&self, _session: SessionId, _outcome: &ExecutionOutcome) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    pool: Arc<CountingPool>,
    observer: Arc<GatedObserver>,
    driver: Driver,
}

fn harness(observer: Arc<GatedObserver>) -> Harness {
    harness_with_pool(observer, Arc::new(CountingPool::new()))
}

fn harness_with_pool(observer: Arc<GatedObserver>, pool: Arc<CountingPool>) -> Harness {
    let clock = Arc::new(ManualClock::new(Tick(0)));
    let driver = Driver::builder(DriverSettings::default())
        .clock(clock.clone())
        .pool(pool.clone())
        .observer(observer.clone())
        .timer_mode(TimerMode::Manual)
        .build();
    driver.start().unwrap();

    Harness {
        clock,
        pool,
        observer,
        driver,
    }
}

fn session(id: u32) -> Arc<Session> {
    Arc::new(Session::new(
        SessionId(id),
        Arc::new(BusDevice::new(create_mock_identity(id), 1, id as u8)),
    ))
}

fn completed(session: &Session) -> u64 {
    session
        .with_record(|r| r.stats().completed)
        .unwrap_or_default()
}

#[test]
fn test_first_firing_after_initial_delay() {
    let h = harness(Arc::new(GatedObserver::default()));
    let s = session(1);
    h.driver.attach(&s, &create_mock_identity(1)).unwrap();

    h.clock.set(Tick(4999));
    assert_eq!(h.driver.timers().run_expired(), 0);

    h.clock.set(Tick(5000));
    assert_eq!(h.driver.timers().run_expired(), 1);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || completed(&s) == 1));

    // Re-armed one period after the execution
    assert_eq!(s.with_record(|r| r.trigger().due()).flatten(), Some(Tick(6000)));
    h.driver.detach(&s).unwrap();
}

#[test]
fn test_periodic_executions_clear_buffer_each_time() {
    let h = harness(Arc::new(GatedObserver::default()));
    let s = session(1);
    h.driver.attach(&s, &create_mock_identity(1)).unwrap();

    for n in 1..=3u64 {
        let due = s.with_record(|r| r.trigger().due()).flatten().unwrap();
        h.clock.set(due);
        assert_eq!(h.driver.timers().run_expired(), 1);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || completed(&s) == n));
    }

    let stats = s.with_record(|r| r.stats()).unwrap();
    assert_eq!(stats.fired, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.buffer_clears, stats.completed);
    assert_eq!(s.with_record(|r| r.status()), Some(DeviceStatus::Active));

    // First execution sees the initial status, later ones see Active
    assert_eq!(
        *h.observer.statuses.lock(),
        vec![DeviceStatus::Idle, DeviceStatus::Active, DeviceStatus::Active]
    );

    h.driver.detach(&s).unwrap();
    assert_eq!(h.pool.outstanding(), 0);
}

#[test]
fn test_rapid_fires_coalesce_into_one_execution() {
    let h = harness(GatedObserver::closed());
    let s = session(1);
    h.driver.attach(&s, &create_mock_identity(1)).unwrap();

    h.clock.set(Tick(5000));
    h.driver.timers().run_expired();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.observer.started() == 1));

    // Execution 1 is held; the next two firings leave a single request
    assert_eq!(
        s.with_record(|r| r.trigger().fire()),
        Some(RequestOutcome::Queued)
    );
    assert_eq!(
        s.with_record(|r| r.trigger().fire()),
        Some(RequestOutcome::Coalesced)
    );

    h.observer.release();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || completed(&s) == 2));

    let stats = s.with_record(|r| r.stats()).unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.coalesced, 1);
    assert_eq!(stats.started, 2);

    h.driver.detach(&s).unwrap();
    assert_eq!(h.observer.finished(), 2);
}

#[test]
fn test_detach_waits_for_running_and_pending_executions() {
    let h = harness(GatedObserver::closed());
    let s = session(1);
    h.driver.attach(&s, &create_mock_identity(1)).unwrap();

    h.clock.set(Tick(5000));
    h.driver.timers().run_expired();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.observer.started() == 1));
    s.with_record(|r| r.trigger().fire());
    s.with_record(|r| r.trigger().fire());

    let observer = h.observer.clone();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        observer.release();
    });

    h.driver.detach(&s).unwrap();

    // Both executions ended before detach returned
    assert_eq!(h.observer.started(), 2);
    assert_eq!(h.observer.finished(), 2);
    assert!(!s.is_bound());
    assert!(h.driver.timers().is_empty());
    assert_eq!(h.pool.outstanding(), 0);
    releaser.join().unwrap();
}

#[test]
fn test_immediate_detach_runs_no_execution() {
    let h = harness(Arc::new(GatedObserver::default()));
    let s = session(1);

    h.driver.attach(&s, &create_mock_identity(1)).unwrap();
    h.driver.detach(&s).unwrap();

    // The cancelled trigger never fires
    h.clock.set(Tick(10_000));
    assert_eq!(h.driver.timers().run_expired(), 0);
    assert_eq!(h.observer.started(), 0);
    assert_eq!(h.pool.outstanding(), 0);
    assert_eq!(h.pool.reserves(), h.pool.releases());
}

#[test]
fn test_record_allocation_failure_leaves_nothing_behind() {
    let pool = Arc::new(CountingPool::failing_on(AllocationKind::Record));
    let h = harness_with_pool(Arc::new(GatedObserver::default()), pool);
    let s = session(1);

    let err = h.driver.attach(&s, &create_mock_identity(1)).unwrap_err();

    assert!(matches!(err, AttachError::OutOfMemory { .. }));
    assert!(!s.is_bound());
    assert_eq!(h.driver.bound_count(), 0);
    assert!(h.driver.timers().is_empty());
    assert_eq!(h.pool.outstanding(), 0);
}

#[test]
fn test_buffer_allocation_failure_releases_record() {
    let pool = Arc::new(CountingPool::failing_on(AllocationKind::Buffer));
    let h = harness_with_pool(Arc::new(GatedObserver::default()), pool);
    let s = session(1);

    let err = h.driver.attach(&s, &create_mock_identity(1)).unwrap_err();

    assert!(matches!(err, AttachError::OutOfMemory { .. }));
    assert!(!s.is_bound());
    assert!(h.driver.timers().is_empty());
    // The record reservation was made and handed back
    assert_eq!(h.pool.reserves(), 1);
    assert_eq!(h.pool.outstanding(), 0);

    // Once memory is available the same session attaches normally
    h.pool.fail_on(None);
    h.driver.attach(&s, &create_mock_identity(1)).unwrap();
    assert!(s.is_bound());
    h.driver.detach(&s).unwrap();
}

#[test]
fn test_device_reference_released_on_detach() {
    let h = harness(Arc::new(GatedObserver::default()));
    let s = session(1);
    let device = Arc::clone(s.device());
    let baseline = Arc::strong_count(&device);

    h.driver.attach(&s, &create_mock_identity(1)).unwrap();
    assert_eq!(Arc::strong_count(&device), baseline + 1);

    h.driver.detach(&s).unwrap();
    assert_eq!(Arc::strong_count(&device), baseline);
}

#[test]
fn test_second_detach_reports_not_attached() {
    let h = harness(Arc::new(GatedObserver::default()));
    let s = session(1);

    h.driver.attach(&s, &create_mock_identity(1)).unwrap();
    h.driver.detach(&s).unwrap();
    assert_eq!(h.driver.detach(&s), Err(DetachError::NotAttached));
}

#[test]
fn test_devices_are_independent() {
    let h = harness(Arc::new(GatedObserver::default()));
    let a = session(1);
    let b = session(2);
    h.driver.attach(&a, &create_mock_identity(1)).unwrap();
    h.driver.attach(&b, &create_mock_identity(2)).unwrap();

    h.clock.set(Tick(5000));
    assert_eq!(h.driver.timers().run_expired(), 2);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        completed(&a) == 1 && completed(&b) == 1
    }));

    h.driver.detach(&a).unwrap();
    assert!(b.is_bound());
    assert_eq!(h.driver.timers().len(), 1);

    h.clock.set(Tick(6000));
    assert_eq!(h.driver.timers().run_expired(), 1);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || completed(&b) == 2));
    h.driver.detach(&b).unwrap();
}

#[test]
fn test_memory_limit_bounds_attached_devices() {
    let settings = DriverSettings::default();
    let per_device = per_device_charge(settings.buffer_size);
    let driver = Driver::builder(settings)
        .pool(Arc::new(LimitedPool::new(per_device)))
        .timer_mode(TimerMode::Manual)
        .build();
    driver.start().unwrap();

    let a = session(1);
    let b = session(2);
    driver.attach(&a, &create_mock_identity(1)).unwrap();
    let err = driver.attach(&b, &create_mock_identity(2)).unwrap_err();
    assert!(matches!(err, AttachError::OutOfMemory { .. }));

    driver.detach(&a).unwrap();
    driver.attach(&b, &create_mock_identity(2)).unwrap();
    assert_eq!(driver.stop(), 1);
}

#[test]
fn test_background_timer_drives_executions() {
    let settings = DriverSettings {
        period: Duration::from_millis(10),
        initial_delay: Duration::from_millis(10),
        ..DriverSettings::default()
    };
    let observer = Arc::new(GatedObserver::default());
    let driver = Driver::builder(settings)
        .observer(observer.clone())
        .build();
    driver.start().unwrap();
    assert!(driver.timers().is_running());

    let s = session(1);
    driver.attach(&s, &create_mock_identity(1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || completed(&s) >= 3));

    driver.detach(&s).unwrap();
    assert_eq!(observer.started(), observer.finished());

    driver.stop();
    assert!(!driver.timers().is_running());
}

#[test]
fn test_simulated_bus_plug_and_unplug() {
    let driver = Driver::builder(DriverSettings::default())
        .timer_mode(TimerMode::Manual)
        .build();
    driver.start().unwrap();
    let mut bus = SimulatedBus::new(Arc::new(driver));

    let (matched, result) = bus.plug(create_mock_identity(0));
    assert!(result.is_ok());
    let (unmatched, result) = bus.plug(create_unknown_identity());
    assert!(matches!(result, Err(AttachError::NoMatch { .. })));
    assert_eq!(bus.len(), 2);
    assert_eq!(bus.driver().bound_count(), 1);

    assert_eq!(bus.unplug(matched), Some(Ok(())));
    assert_eq!(bus.unplug(unmatched), Some(Ok(())));
    assert_eq!(bus.unplug(SessionId(99)), None);
    assert!(bus.is_empty());
    assert_eq!(bus.driver().bound_count(), 0);
}

#[test]
fn test_wildcard_id_table() {
    let settings = DriverSettings {
        id_table: DeviceIdTable::parse(&["0x1234:*"]).unwrap(),
        ..DriverSettings::default()
    };
    let driver = Driver::builder(settings)
        .timer_mode(TimerMode::Manual)
        .build();
    driver.start().unwrap();

    let s = session(1);
    driver.attach(&s, &DeviceIdentity::new(0x1234, 0x0001)).unwrap();
    let other = session(2);
    assert!(matches!(
        driver.attach(&other, &DeviceIdentity::new(0x4321, 0x0001)),
        Err(AttachError::NoMatch { .. })
    ));
    assert_eq!(driver.stop(), 1);
}
