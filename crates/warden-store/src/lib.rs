//! Warden Store
//!
//! Durable state of the patch pipeline and its audit trail.
//!
//! # Core Concepts
//!
//! - [`PatchRecord`]: one proposed file replacement and its lifecycle status
//! - [`PatchEvent`]: append-only log, exactly one entry per status transition
//! - [`CodeVersion`]: prior content of a file, saved before each overwrite
//! - [`IdempotencyRecord`]: terminal result of a logical request, first writer wins
//! - [`Snapshot`]: metadata of a whole-tree archive
//! - [`PatchStore`]: the storage trait; [`SqliteStore`] implements it
//! - [`EventSink`]: fire-and-forget external audit logger
//!
//! # Lifecycle
//!
//! ```text
//! submitted ─► validated ─► approved ─► applying ─► success
//!     │            │                        └─────► rolled_back
//!     └────────────┴──► rejected
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod model;
mod sink;
mod sqlite;
mod store;

pub use error::StoreError;
pub use model::{
    CodeVersion, EventType, IdempotencyRecord, PatchEvent, PatchId, PatchRecord, PatchStatus,
    Snapshot,
};
pub use sink::{emit, EventSink, JsonlEventSink, SinkError, SinkRecord, TracingEventSink};
pub use sqlite::SqliteStore;
pub use store::PatchStore;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
