//! # Floe Mesh
//!
//! Distributed coordination of import channels across a cluster of floe
//! nodes. A *channel* is one `(importer, resource URI)` pair — a single
//! ingestible data source. Every node proposes the channels its importers
//! want consumed; the proposals are merged into a cluster-wide master list
//! held in the coordination store; an elected leader distributes the master
//! list fairly across all live nodes; each node mirrors its own slice and
//! notifies the importers it hosts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ChannelDistributer                       │
//! ├──────────────┬──────────────┬───────────────────────────────┤
//! │   Leader     │   Channel    │        Assignment             │
//! │   Election   │   Registry   │        Mirror                 │
//! ├──────────────┼──────────────┼───────────────────────────────┤
//! │ • Ephemeral  │ • Master     │ • Per-host watch              │
//! │   candidates │   list merge │ • Stale-write rejection       │
//! │ • Implicit   │ • CAS retry  │ • Per-importer deltas         │
//! │   failover   │   loops      │ • Buffered replay             │
//! └──────────────┴──────────────┴───────────────────────────────┘
//!                              │
//!                              ▼
//!                  MeshStore (watchable, versioned,
//!                  hierarchical coordination substrate)
//! ```
//!
//! # Rebalancing
//!
//! Only additions and removals ever move: a channel assigned to a live host
//! stays there across rebalances. New channels are spread across
//! under-loaded hosts so that after a stable run no two hosts differ by
//! more than one channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use floe_mesh::{ChannelDistributer, MemoryMeshStore, MeshConfig, OperationMode};
//!
//! let store = MemoryMeshStore::new();
//! let distributer = ChannelDistributer::start(
//!     store.session(),
//!     "host-1",
//!     OperationMode::Running,
//!     MeshConfig::default(),
//! ).await?;
//!
//! distributer.register_callback("csv", callback)?;
//! distributer.register_channels("csv", uris).await?;
//! ```

pub mod assign;
pub mod config;
pub mod distributer;
pub mod error;
pub mod mode;
pub mod monitor;
pub mod spec;
pub mod stamped;
pub mod store;

pub use config::{MeshConfig, MeshPaths};
pub use distributer::{ChannelChangeCallback, ChannelDistributer};
pub use error::{MeshError, MeshResult};
pub use mode::{OperationMode, VersionedOperationMode};
pub use spec::{ChannelAssignment, ChannelSpec, ImporterChannelAssignment};
pub use stamped::Stamped;
pub use store::memory::{MemoryMeshStore, MemorySession};
pub use store::{
    ChildrenReply, CreateMode, DataReply, MeshStore, NodeStat, StoreError, StoreResult, Watch,
    WatchEvent, ANY_VERSION,
};
