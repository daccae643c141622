//! Importer SDK traits
//!
//! An importer consumes one resource URI. Its `accept` loop runs until
//! [`ImporterContext::should_run`] flips false, polling back-pressure
//! before every downstream call:
//!
//! ```rust,ignore
//! async fn accept(&self, ctx: ImporterContext) -> ImportResult<()> {
//!     while ctx.should_run() {
//!         if ctx.has_back_pressure() {
//!             tokio::time::sleep(Duration::from_millis(10)).await;
//!             continue;
//!         }
//!         let row = self.next_row().await?;
//!         ctx.call_procedure("ingest_line", row).await;
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::ImportResult;
use crate::procedure::ProcedureInvoker;
use crate::stats::ImportStatsSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// Declared configuration for one importable resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// The resource to consume
    pub uri: Url,
    /// Stored procedure rows are fed to
    pub procedure: String,
    /// Connector-specific settings
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ResourceConfig {
    pub fn new(uri: Url, procedure: impl Into<String>) -> Self {
        Self {
            uri,
            procedure: procedure.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// Handle given to every worker: the stop flag, back-pressure polling, and
/// the downstream procedure call
#[derive(Clone)]
pub struct ImporterContext {
    importer: String,
    procedure: String,
    stopping: Arc<AtomicBool>,
    invoker: Arc<dyn ProcedureInvoker>,
    stats: Arc<dyn ImportStatsSink>,
}

impl ImporterContext {
    pub(crate) fn new(
        importer: String,
        procedure: String,
        stopping: Arc<AtomicBool>,
        invoker: Arc<dyn ProcedureInvoker>,
        stats: Arc<dyn ImportStatsSink>,
    ) -> Self {
        Self {
            importer,
            procedure,
            stopping,
            invoker,
            stats,
        }
    }

    /// Workers loop on this; it flips false promptly once the worker is
    /// stopped
    pub fn should_run(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    /// Poll before every downstream call
    pub fn has_back_pressure(&self) -> bool {
        self.invoker.has_back_pressure()
    }

    pub fn importer(&self) -> &str {
        &self.importer
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Feed one row to the configured procedure. Returns whether the
    /// invocation was accepted.
    pub async fn call_procedure(&self, params: Vec<Value>) -> bool {
        let accepted = self
            .invoker
            .call_procedure(&self.importer, &self.procedure, params)
            .await;
        if accepted {
            self.stats.report_queued(&self.importer, &self.procedure);
        } else {
            self.stats.report_failure(&self.importer, &self.procedure);
        }
        accepted
    }
}

/// One running data source
#[async_trait]
pub trait Importer: Send + Sync {
    /// The resource this importer consumes
    fn uri(&self) -> &Url;

    /// The consume loop; expected to return promptly after
    /// `ctx.should_run()` flips false
    async fn accept(&self, ctx: ImporterContext) -> ImportResult<()>;

    /// Release held resources; invoked after the stop flag is set
    async fn stop(&self) {}
}

/// Creates importers for one importer type (designation)
pub trait ImporterFactory: Send + Sync {
    /// The importer designation, unique per type
    fn name(&self) -> &str;

    /// Run-everywhere importers start one worker per configured resource
    /// on every node instead of registering with the mesh
    fn run_everywhere(&self) -> bool {
        false
    }

    /// Build an importer for one configured resource
    fn create(&self, config: &ResourceConfig) -> ImportResult<Arc<dyn Importer>>;
}
