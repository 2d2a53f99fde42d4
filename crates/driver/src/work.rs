//! Deferred handler and its worker thread
//!
//! Each attached device gets one worker thread that drains the device's
//! capacity-one work mailbox. A single worker per record is what guarantees
//! that at most one handler execution for that record runs at a time. The
//! worker owns the device buffer for its whole life and hands it back when
//! it exits.

use crate::error::{DetachError, HandlerFault};
use crate::record::{DeviceBuffer, DeviceStats, DeviceStatus, StatusCell};
use crate::trigger::PeriodicTrigger;
use common::{SessionId, WorkReceiver, WorkRequester};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Instrumentation hooks around handler executions
///
/// Hooks run on the device's worker thread and may block; blocking in
/// [`ExecutionObserver::execution_started`] delays the execution.
pub trait ExecutionObserver: Send + Sync + 'static {
    fn execution_started(&self, _session: SessionId, _status: DeviceStatus) {}

    fn buffer_cleared(&self, _session: SessionId, _capacity: usize) {}

    fn execution_finished(&self, _session: SessionId, _outcome: &ExecutionOutcome) {}
}

/// Observer that does nothing
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// What one handler execution did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Buffer cleared; `rearmed` is false once the trigger is shut down
    Completed { status: DeviceStatus, rearmed: bool },
    /// The execution detected a fault and did nothing
    Faulted(HandlerFault),
}

/// State owned by a device's worker thread
pub(crate) struct HandlerState {
    session: SessionId,
    buffer: Option<DeviceBuffer>,
    status: Arc<StatusCell>,
    stats: Arc<DeviceStats>,
    trigger: Arc<PeriodicTrigger>,
    observer: Arc<dyn ExecutionObserver>,
}

impl HandlerState {
    pub(crate) fn new(
        session: SessionId,
        buffer: DeviceBuffer,
        status: Arc<StatusCell>,
        stats: Arc<DeviceStats>,
        trigger: Arc<PeriodicTrigger>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        Self {
            session,
            buffer: Some(buffer),
            status,
            stats,
            trigger,
            observer,
        }
    }

    /// One handler execution: read status, clear the buffer, re-arm
    pub(crate) fn execute(&mut self) -> ExecutionOutcome {
        let status = self.status.get();
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        self.observer.execution_started(self.session, status);
        debug!("{}: work handler called, status={}", self.session, status.code());

        let outcome = match self.process() {
            Ok(rearmed) => {
                self.stats.completed.fetch_add(1, Ordering::SeqCst);
                ExecutionOutcome::Completed { status, rearmed }
            }
            Err(fault) => {
                self.stats.faults.fetch_add(1, Ordering::SeqCst);
                warn!("{}: handler skipped: {}", self.session, fault);
                ExecutionOutcome::Faulted(fault)
            }
        };

        self.observer.execution_finished(self.session, &outcome);
        outcome
    }

    fn process(&mut self) -> Result<bool, HandlerFault> {
        let buffer = self
            .buffer
            .as_mut()
            .ok_or(HandlerFault::RecordAlreadyTornDown)?;

        buffer.clear();
        self.stats.buffer_clears.fetch_add(1, Ordering::SeqCst);
        self.observer.buffer_cleared(self.session, buffer.capacity());

        self.status.set(DeviceStatus::Active);

        let rearmed = self.trigger.rearm();
        if !rearmed {
            debug!("{}: trigger shut down, not re-armed", self.session);
        }
        Ok(rearmed)
    }

    /// Give up the buffer (detach frees it)
    pub(crate) fn into_buffer(mut self) -> Option<DeviceBuffer> {
        self.buffer.take()
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self) -> Option<&mut DeviceBuffer> {
        self.buffer.as_mut()
    }
}

/// Handle to a device's worker thread
pub(crate) struct DeferredWork {
    session: SessionId,
    requester: WorkRequester,
    handle: Option<JoinHandle<HandlerState>>,
}

impl DeferredWork {
    /// Start the worker thread for `state`
    pub(crate) fn spawn(
        state: HandlerState,
        requester: WorkRequester,
        receiver: WorkReceiver,
    ) -> std::io::Result<Self> {
        let session = state.session;
        let handle = std::thread::Builder::new()
            .name(format!("work-{}", session.0))
            .spawn(move || run_worker(state, receiver))?;

        Ok(Self {
            session,
            requester,
            handle: Some(handle),
        })
    }

    /// Stop accepting requests, let a pending execution run, and wait for
    /// the worker to exit
    pub(crate) fn close_and_wait(mut self) -> Result<HandlerState, DetachError> {
        self.requester.close();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                error!("{}: deferred worker panicked", self.session);
                DetachError::WorkerPanicked
            }),
            None => Err(DetachError::WorkerPanicked),
        }
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.requester.close();
            if handle.join().is_err() {
                error!("{}: deferred worker panicked", self.session);
            }
        }
    }
}

fn run_worker(mut state: HandlerState, receiver: WorkReceiver) -> HandlerState {
    info!("{}: deferred worker started", state.session);

    while receiver.recv().is_ok() {
        // A panicking execution is absorbed; there is no caller to report to
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| state.execute()));
        if let Err(e) = result {
            error!("{}: panic in work handler: {:?}", state.session, e);
        }
    }

    info!("{}: deferred worker stopped", state.session);
    state
}
