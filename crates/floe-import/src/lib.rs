//! # Floe Import
//!
//! Importer SDK and lifecycle layer. An *importer* pulls data from one
//! resource (a Kafka partition, a file, a JDBC cursor) and feeds it to the
//! database through the procedure-invocation adapter. This crate defines
//! the traits importers implement and the [`ImporterLifeCycleManager`]
//! that starts and stops importer workers as the channel distribution
//! mesh assigns and revokes resources.
//!
//! # Lifecycle
//!
//! ```text
//! UNSTARTED ──configure──▶ READY ──ready_for_data──▶ RUNNING
//!                                                       │
//!                                        on_change starts/stops workers
//!                                                       │
//!                                  stop ──▶ STOPPING ──▶ STOPPED
//! ```
//!
//! Importer types either run *everywhere* (one worker per configured
//! resource on every node) or register with the mesh and run workers only
//! for the resources assigned to this node.

pub mod error;
pub mod importer;
pub mod lifecycle;
pub mod procedure;
pub mod stats;

pub use error::{ImportError, ImportResult};
pub use importer::{Importer, ImporterContext, ImporterFactory, ResourceConfig};
pub use lifecycle::{ImporterLifeCycleManager, ManagerState};
pub use procedure::{ProcedureInvoker, RecordingInvoker};
pub use stats::{CountingStatsSink, ImportStatsSink, NoopStatsSink};
