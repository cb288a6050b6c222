use crate::Error;

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_transport::ConfirmOutcome;
use serde::Serialize;

/// Receives engine events. Every method defaults to doing nothing.
pub trait EngineObserver
where
    Self: Debug + Send + Sync + 'static,
{
    /// The producer's write buffer is full; publishing pauses.
    fn on_overflow(&self, _engine_id: &str) {}

    /// The write buffer drained; publishing resumes.
    fn on_drain(&self, _engine_id: &str) {}

    /// The broker settled a confirmed publish.
    fn on_confirm(&self, _engine_id: &str, _sequence: u64, _outcome: ConfirmOutcome) {}

    /// A produce call failed for a reason other than a broker nack.
    fn on_produce_rejected(&self, _engine_id: &str, _error: &Error) {}

    /// A delivery handler returned an error, panicked or left its delivery unsettled.
    fn on_handler_fault(&self, _engine_id: &str, _consumer_tag: &str, _fault: &str) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}

/// Observer that counts events.
#[derive(Debug, Default)]
pub struct CountingObserver {
    overflows: AtomicU64,
    drains: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    rejected: AtomicU64,
    faults: AtomicU64,
}

/// A point-in-time copy of a [`CountingObserver`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObserverCounts {
    /// Overflow events.
    pub overflows: u64,
    /// Drain events.
    pub drains: u64,
    /// Publishes acked by the broker.
    pub acked: u64,
    /// Publishes nacked by the broker.
    pub nacked: u64,
    /// Produce calls refused locally.
    pub rejected: u64,
    /// Handler faults.
    pub faults: u64,
}

impl CountingObserver {
    /// Creates an observer with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every counter.
    #[must_use]
    pub fn counts(&self) -> ObserverCounts {
        ObserverCounts {
            overflows: self.overflows.load(Ordering::SeqCst),
            drains: self.drains.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            faults: self.faults.load(Ordering::SeqCst),
        }
    }
}

impl EngineObserver for CountingObserver {
    fn on_overflow(&self, _engine_id: &str) {
        self.overflows.fetch_add(1, Ordering::SeqCst);
    }

    fn on_drain(&self, _engine_id: &str) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    fn on_confirm(&self, _engine_id: &str, _sequence: u64, outcome: ConfirmOutcome) {
        match outcome {
            ConfirmOutcome::Ack => self.acked.fetch_add(1, Ordering::SeqCst),
            ConfirmOutcome::Nack => self.nacked.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn on_produce_rejected(&self, _engine_id: &str, _error: &Error) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_handler_fault(&self, _engine_id: &str, _consumer_tag: &str, _fault: &str) {
        self.faults.fetch_add(1, Ordering::SeqCst);
    }
}
