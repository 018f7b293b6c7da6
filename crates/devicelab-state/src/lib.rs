//! devicelab-state — embedded record store for the Device Lab.
//!
//! Backed by [redb](https://docs.rs/redb), holds the pools, provisions,
//! reservations, and devices records the provisioning workflow operates on.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{account}:{pool}`, `{account}:{pool}:{provision}`)
//! enable prefix scans for related records.
//!
//! Every committed put/delete also emits a [`RecordChange`] on a broadcast
//! channel — the change feed the lifecycle controller subscribes to in
//! order to start and stop orchestration runs.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod changes;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use changes::{ChangeKind, RecordChange, RecordKey};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
