//! Statistics sink adapter
//!
//! The hosting process aggregates and reports import statistics; workers
//! only ever push raw counts through this interface.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait ImportStatsSink: Send + Sync {
    /// A row was queued for the given procedure
    fn report_queued(&self, importer: &str, procedure: &str);

    /// An invocation failed or was refused
    fn report_failure(&self, importer: &str, procedure: &str);

    /// A worker finished initializing for the given procedure
    fn report_initialized(&self, importer: &str, procedure: &str);
}

/// Drops everything
#[derive(Default)]
pub struct NoopStatsSink;

impl ImportStatsSink for NoopStatsSink {
    fn report_queued(&self, _importer: &str, _procedure: &str) {}
    fn report_failure(&self, _importer: &str, _procedure: &str) {}
    fn report_initialized(&self, _importer: &str, _procedure: &str) {}
}

/// Counts events; the test double used across the suite
#[derive(Default)]
pub struct CountingStatsSink {
    queued: AtomicU64,
    failures: AtomicU64,
    initialized: AtomicU64,
}

impl CountingStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> u64 {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl ImportStatsSink for CountingStatsSink {
    fn report_queued(&self, _importer: &str, _procedure: &str) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    fn report_failure(&self, _importer: &str, _procedure: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn report_initialized(&self, _importer: &str, _procedure: &str) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }
}
