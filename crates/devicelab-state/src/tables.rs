//! redb table definitions for the Device Lab record store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized record
//! types). Composite keys are colon-joined so that prefix scans walk a
//! pool's or a provision's children.

use redb::TableDefinition;

/// Device pools keyed by `{account}:{name}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Provision requests keyed by `{account}:{pool}:{provision_id}`.
pub const PROVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("provisions");

/// Device reservations keyed by `{account}:{pool}:{provision_id}:{device_id}`.
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");

/// Pool device inventory keyed by `{account}:{pool}:{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
