//! StateStore — redb-backed persistence for Device Lab records.
//!
//! Provides typed CRUD operations over pools, provisions, reservations, and
//! devices, plus the change feed. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::changes::{ChangeKind, RecordChange, RecordKey};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Buffered change events per subscriber before lag kicks in.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    changes: broadcast::Sender<RecordChange>,
}

impl StateStore {
    /// Open (or create) a persistent record store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::wrap(db)?;
        debug!(?path, "record store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory record store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::wrap(db)?;
        debug!("in-memory record store opened");
        Ok(store)
    }

    fn wrap(db: Database) -> StateResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            changes,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Subscribe to the change feed. Events are emitted after commit.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(PROVISIONS).map_err(map_err!(Table))?;
        txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic table plumbing ─────────────────────────────────────

    /// Upsert a record; returns true when the key already existed.
    fn put<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        record: &T,
    ) -> StateResult<bool> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn get<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Scan records whose key starts with `prefix` (empty prefix lists all).
    fn scan<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Delete a record; returns true if it existed.
    fn delete(&self, table_def: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn emit(&self, kind: ChangeKind, key: RecordKey) {
        // No subscribers is fine; the feed is best-effort.
        let _ = self.changes.send(RecordChange { kind, key });
    }

    fn emit_put(&self, existed: bool, key: RecordKey) {
        let kind = if existed {
            ChangeKind::Modified
        } else {
            ChangeKind::Inserted
        };
        self.emit(kind, key);
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a device pool.
    pub fn put_pool(&self, pool: &DevicePoolRecord) -> StateResult<()> {
        let key = pool.table_key();
        let existed = self.put(POOLS, &key, pool)?;
        debug!(%key, existed, "pool stored");
        self.emit_put(existed, RecordKey::Pool(key));
        Ok(())
    }

    /// Get a pool by `{account}:{name}` key.
    pub fn get_pool(&self, key: &str) -> StateResult<Option<DevicePoolRecord>> {
        self.get(POOLS, key)
    }

    /// List all pools for an account.
    pub fn list_pools(&self, account: &str) -> StateResult<Vec<DevicePoolRecord>> {
        self.scan(POOLS, &format!("{account}:"))
    }

    /// Delete a pool by key. Returns true if it existed.
    pub fn delete_pool(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(POOLS, key)?;
        if existed {
            self.emit(ChangeKind::Removed, RecordKey::Pool(key.to_string()));
        }
        Ok(existed)
    }

    // ── Provisions ─────────────────────────────────────────────────

    /// Insert or update a provision request.
    pub fn put_provision(&self, provision: &ProvisionRecord) -> StateResult<()> {
        let key = provision.table_key();
        let existed = self.put(PROVISIONS, &key, provision)?;
        debug!(%key, existed, status = ?provision.status, "provision stored");
        self.emit_put(existed, RecordKey::Provision(key));
        Ok(())
    }

    /// Get a provision by `{account}:{pool}:{id}` key.
    pub fn get_provision(&self, key: &str) -> StateResult<Option<ProvisionRecord>> {
        self.get(PROVISIONS, key)
    }

    /// List all provisions against a pool.
    pub fn list_provisions_for_pool(
        &self,
        account: &str,
        pool_name: &str,
    ) -> StateResult<Vec<ProvisionRecord>> {
        self.scan(PROVISIONS, &format!("{}:", pool_key(account, pool_name)))
    }

    /// Delete a provision by key. Returns true if it existed.
    pub fn delete_provision(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(PROVISIONS, key)?;
        if existed {
            self.emit(ChangeKind::Removed, RecordKey::Provision(key.to_string()));
        }
        Ok(existed)
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Insert or update a device reservation.
    pub fn put_reservation(&self, reservation: &ReservationRecord) -> StateResult<()> {
        let key = reservation.table_key();
        let existed = self.put(RESERVATIONS, &key, reservation)?;
        self.emit_put(existed, RecordKey::Reservation(key));
        Ok(())
    }

    /// Reserve a device for a provision only if no other active
    /// reservation in the pool holds that device. The availability check
    /// and the insert share one write transaction, so concurrent callers
    /// cannot both claim the same device. Returns false when the device
    /// was already held.
    pub fn try_reserve_device(&self, reservation: &ReservationRecord) -> StateResult<bool> {
        let key = reservation.table_key();
        let pool_prefix = format!(
            "{}:",
            pool_key(&reservation.account, &reservation.pool_name)
        );
        let value = serde_json::to_vec(reservation).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut existed = false;
        let held = {
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            let mut held = false;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (entry_key, entry_value) = entry.map_err(map_err!(Read))?;
                if !entry_key.value().starts_with(&pool_prefix) {
                    continue;
                }
                let existing: ReservationRecord =
                    serde_json::from_slice(entry_value.value()).map_err(map_err!(Deserialize))?;
                if existing.device_id == reservation.device_id
                    && existing.status == ReservationStatus::Reserved
                {
                    held = true;
                    break;
                }
            }
            if !held {
                existed = table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?
                    .is_some();
            }
            held
        };
        if held {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%key, "device already held, reservation skipped");
            return Ok(false);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.emit_put(existed, RecordKey::Reservation(key));
        Ok(true)
    }

    /// List reservations held by one provision.
    pub fn list_reservations_for_provision(
        &self,
        provision_key: &str,
    ) -> StateResult<Vec<ReservationRecord>> {
        self.scan(RESERVATIONS, &format!("{provision_key}:"))
    }

    /// List reservations across a whole pool (all provisions).
    pub fn list_reservations_for_pool(
        &self,
        account: &str,
        pool_name: &str,
    ) -> StateResult<Vec<ReservationRecord>> {
        self.scan(RESERVATIONS, &format!("{}:", pool_key(account, pool_name)))
    }

    /// Delete all reservations held by a provision. Returns number deleted.
    pub fn delete_reservations_for_provision(&self, provision_key: &str) -> StateResult<u32> {
        let prefix = format!("{provision_key}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        for key in keys {
            self.emit(ChangeKind::Removed, RecordKey::Reservation(key));
        }
        Ok(count)
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device inventory entry.
    pub fn put_device(&self, device: &DeviceRecord) -> StateResult<()> {
        let key = device.table_key();
        let existed = self.put(DEVICES, &key, device)?;
        self.emit_put(existed, RecordKey::Device(key));
        Ok(())
    }

    /// Get a device by `{account}:{pool}:{id}` key.
    pub fn get_device(&self, key: &str) -> StateResult<Option<DeviceRecord>> {
        self.get(DEVICES, key)
    }

    /// List the device inventory of a pool.
    pub fn list_devices_for_pool(
        &self,
        account: &str,
        pool_name: &str,
    ) -> StateResult<Vec<DeviceRecord>> {
        self.scan(DEVICES, &format!("{}:", pool_key(account, pool_name)))
    }

    /// Delete a device by key. Returns true if it existed.
    pub fn delete_device(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(DEVICES, key)?;
        if existed {
            self.emit(ChangeKind::Removed, RecordKey::Device(key.to_string()));
        }
        Ok(existed)
    }
}
