//! State shared between producers, consumers and the estimation thread.
//!
//! The estimation thread is the only writer. Readers get the latest
//! published snapshot by cloning an `Arc` under a read lock, so a snapshot
//! is never observed half-written.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::snapshot::FilterSnapshot;
use crate::error::DivergenceReason;

pub struct SharedState {
    snapshot: RwLock<Arc<FilterSnapshot>>,

    /// Timestamp of the last published snapshot, as `f64` bits.
    committed: AtomicU64,

    /// Set by the estimation thread when the session diverges; cleared by
    /// a reset.
    divergence: Mutex<Option<DivergenceReason>>,

    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(initial: FilterSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(initial)),
            committed: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            divergence: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<FilterSnapshot> {
        self.snapshot.read().clone()
    }

    /// Replace the snapshot and advance the committed timestamp.
    pub fn publish(&self, snapshot: FilterSnapshot) {
        let timestamp = snapshot.timestamp;
        *self.snapshot.write() = Arc::new(snapshot);
        self.committed.store(timestamp.to_bits(), Ordering::SeqCst);
    }

    /// Publish a snapshot and rewind the committed timestamp (after a reset).
    pub fn republish(&self, snapshot: FilterSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
        self.committed.store(f64::NEG_INFINITY.to_bits(), Ordering::SeqCst);
    }

    pub fn committed_timestamp(&self) -> f64 {
        f64::from_bits(self.committed.load(Ordering::SeqCst))
    }

    pub fn divergence(&self) -> Option<DivergenceReason> {
        self.divergence.lock().clone()
    }

    pub fn set_divergence(&self, reason: Option<DivergenceReason>) {
        *self.divergence.lock() = reason;
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
