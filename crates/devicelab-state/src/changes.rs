//! Change feed events.
//!
//! The store emits one `RecordChange` per committed put/delete. The
//! lifecycle controller consumes these to start and stop orchestration
//! runs; other subscribers (audit, metrics) can attach without coordination.

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Modified,
    Removed,
}

/// Which record changed, carrying its composite table key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Pool(String),
    Provision(String),
    Reservation(String),
    Device(String),
}

impl RecordKey {
    /// The raw composite key, whichever table it belongs to.
    pub fn key(&self) -> &str {
        match self {
            RecordKey::Pool(k)
            | RecordKey::Provision(k)
            | RecordKey::Reservation(k)
            | RecordKey::Device(k) => k,
        }
    }
}

/// A single mutation observed on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub kind: ChangeKind,
    pub key: RecordKey,
}
