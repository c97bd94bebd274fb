//! # pmtree - Persistent Metadata Tree Storage Engine
//!
//! pmtree provides durable, random-access storage for a hierarchical
//! metadata tree (databases, devices, measurements) whose size exceeds
//! memory. Tree nodes and their parent→child records are laid out in a
//! paged file; a bounded in-memory working set stays synchronised with
//! disk under concurrent read traffic.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pmtree::{NodeKind, StoreConfig, TreeStore};
//!
//! let store = TreeStore::open(
//!     StoreConfig::new("./sg1.pmt")
//!         .page_cache_capacity(48)
//!         .node_cache_capacity(10_000),
//! )?;
//!
//! let db = store.add_child(store.root(), "db1", NodeKind::Database)?;
//! let dev = store.add_child(db, "dev1", NodeKind::Device { aligned: false })?;
//! store.flush()?;
//!
//! let found = store.get_child(db, "dev1")?;
//! assert_eq!(found, Some(dev));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (TreeStore)        │
//! ├──────────────────┬──────────────────┤
//! │  CacheCoordinator│   LockManager    │
//! │  (volatile/pin/  │  (per-node R/W   │
//! │   eviction)      │   + lock pool)   │
//! ├──────────────────┴──────────────────┤
//! │        SchemaFile (addressing,       │
//! │      growth, chaining, page cache)   │
//! ├─────────────────────────────────────┤
//! │   Page (16KB slab, segment table)    │
//! ├─────────────────────────────────────┤
//! │  Segment (ordered key→record store)  │
//! ├─────────────────────────────────────┤
//! │   Record / byte codec (big-endian)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! sg1.pmt
//! ├── file header (256 B): last page, root name, format version
//! ├── page 0: root children segment (pinned in cache)
//! ├── page 1..N: segments in five size classes
//! └── chains: full-size segments linked prev/next when one overflows
//! ```
//!
//! ## Module Overview
//!
//! - [`store`]: the cached tree store tying everything together
//! - [`storage`]: schema file, pages, segments, records, page cache
//! - [`cache`]: per-node cache state machine, flush and eviction
//! - [`lock`]: writer-preferred per-node locks with stamped reads
//! - [`node`]: arena-owned tree nodes and child bookkeeping
//! - [`encoding`]: bounds-checked big-endian primitives
//! - [`config`]: layout constants and runtime configuration
//! - [`error`]: the typed storage error the growth machinery branches on

pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod lock;
pub mod node;
pub mod storage;
pub mod store;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use node::{NodeId, NodeKind};
pub use storage::{NodeRecord, SchemaFile, SegmentAddress};
pub use store::TreeStore;
