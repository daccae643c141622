//! Procedure-invocation adapter
//!
//! Importers never talk to the database engine directly; they hand rows to
//! an injected [`ProcedureInvoker`]. Workers are expected to poll
//! [`ProcedureInvoker::has_back_pressure`] before every call and yield
//! while the engine is saturated.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait ProcedureInvoker: Send + Sync {
    /// Whether the engine is currently pushing back
    fn has_back_pressure(&self) -> bool;

    /// Invoke a stored procedure on behalf of `importer`. Returns whether
    /// the invocation was accepted for execution.
    async fn call_procedure(&self, importer: &str, procedure: &str, params: Vec<Value>) -> bool;
}

/// Records every invocation; the test double used across the suite
#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<(String, String, Vec<Value>)>>,
    back_pressure: AtomicBool,
    reject: AtomicBool,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_back_pressure(&self, engaged: bool) {
        self.back_pressure.store(engaged, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ProcedureInvoker for RecordingInvoker {
    fn has_back_pressure(&self) -> bool {
        self.back_pressure.load(Ordering::SeqCst)
    }

    async fn call_procedure(&self, importer: &str, procedure: &str, params: Vec<Value>) -> bool {
        if self.reject.load(Ordering::SeqCst) {
            return false;
        }
        self.calls
            .lock()
            .push((importer.to_string(), procedure.to_string(), params));
        true
    }
}
