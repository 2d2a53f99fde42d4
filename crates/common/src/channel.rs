//! Coalescing mailbox between the timer context and a device worker
//!
//! The mailbox has capacity one. The timer side only ever calls
//! [`WorkRequester::request`], which is a non-blocking `try_send`: a full
//! mailbox means an execution is already pending and the request coalesces
//! into it. The worker side blocks in [`WorkReceiver::recv`].
//!
//! Closing the mailbox stops new requests but keeps a pending one
//! receivable, so a worker draining the receiver runs it before it observes
//! the close.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

/// Result of a non-blocking execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new execution was queued
    Queued,
    /// An execution was already pending; this request merged into it
    Coalesced,
    /// The mailbox is closed (device detaching); nothing was queued
    Closed,
}

/// Requesting half of the mailbox (timer context)
#[derive(Debug, Clone)]
pub struct WorkRequester {
    tx: Sender<()>,
}

impl WorkRequester {
    /// Request one execution without blocking
    pub fn request(&self) -> RequestOutcome {
        match self.tx.try_send(()) {
            Ok(()) => RequestOutcome::Queued,
            Err(TrySendError::Full(())) => RequestOutcome::Coalesced,
            Err(TrySendError::Closed(())) => RequestOutcome::Closed,
        }
    }

    /// Whether an execution is queued and not yet picked up by the worker
    pub fn is_pending(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Close the mailbox; returns `false` if it was already closed
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Draining half of the mailbox (worker context)
#[derive(Debug)]
pub struct WorkReceiver {
    rx: Receiver<()>,
}

impl WorkReceiver {
    /// Block until an execution is requested
    ///
    /// Returns an error once the mailbox is closed and drained.
    pub fn recv(&self) -> crate::Result<()> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take a pending request without blocking
    pub fn try_recv(&self) -> Option<()> {
        match self.rx.try_recv() {
            Ok(()) => Some(()),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }
}

/// Create a capacity-one work mailbox
///
/// Returns (WorkRequester for the timer side, WorkReceiver for the worker)
pub fn create_work_mailbox() -> (WorkRequester, WorkReceiver) {
    let (tx, rx) = bounded(1);
    (WorkRequester { tx }, WorkReceiver { rx })
}
