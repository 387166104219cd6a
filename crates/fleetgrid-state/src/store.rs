//! StateStore — redb-backed backing store for FleetGrid.
//!
//! Provides point and filtered-query CRUD over game server mirror rows and
//! the raw primitives of the port registry. Mirror rows are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so a read-then-insert inside one
//! write transaction is a true conditional insert.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        txn.open_table(PORTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Entity mirror ──────────────────────────────────────────────

    /// Insert a mirror row, or merge the non-empty properties of `patch`
    /// into the existing one.
    ///
    /// Fails with `Validation` when the namespace or name is empty.
    pub fn upsert_entity(&self, patch: &GameServerEntity) -> StateResult<()> {
        if !patch.has_identity() {
            return Err(StateError::Validation(
                "entity must include both namespace and name".to_string(),
            ));
        }

        let key = patch.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
            let existing = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice::<GameServerEntity>(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;

            let mut row = existing
                .unwrap_or_else(|| GameServerEntity::new(&patch.namespace, &patch.name));
            row.merge(patch);

            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "entity upserted");
        Ok(())
    }

    /// Point lookup of a mirror row. Fails with `NotFound` if absent.
    pub fn get_entity(&self, namespace: &str, name: &str) -> StateResult<GameServerEntity> {
        let key = entity_key(namespace, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::NotFound(key)),
        }
    }

    /// All mirror rows matching every predicate of `filter`.
    pub fn query_entities(&self, filter: &EntityFilter) -> StateResult<Vec<GameServerEntity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: GameServerEntity =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if filter.matches(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    /// Rows whose status is exactly `Running`.
    pub fn query_running(&self) -> StateResult<Vec<GameServerEntity>> {
        self.query_entities(&EntityFilter::new().eq(EntityField::Status, STATUS_RUNNING))
    }

    /// Rows marked for deletion whose active session count is exactly `0`.
    ///
    /// This is the set the drain sweep is allowed to hard-delete.
    pub fn query_marked_for_deletion_zero_sessions(&self) -> StateResult<Vec<GameServerEntity>> {
        self.query_entities(
            &EntityFilter::new()
                .eq(EntityField::Status, STATUS_MARKED_FOR_DELETION)
                .eq(EntityField::ActiveSessions, "0"),
        )
    }

    /// Remove an instance's mirror row and release its port.
    ///
    /// The row's stored port is read first. An unparsable port aborts the
    /// whole operation with `InvalidPort` and leaves both rows in place.
    /// Otherwise the mirror row and the port registry row are removed in a
    /// single write transaction, so a port is never freed while a row still
    /// claims it. A port row that is already gone is not an error.
    pub fn delete_instance(&self, namespace: &str, name: &str) -> StateResult<()> {
        let key = entity_key(namespace, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let port = {
            let mut entities = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
            let row = entities
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice::<GameServerEntity>(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?
                .ok_or_else(|| StateError::NotFound(key.clone()))?;

            let port = row.parsed_port()?;

            entities.remove(key.as_str()).map_err(map_err!(Write))?;

            if let Some(port) = port {
                let mut ports = txn.open_table(PORTS).map_err(map_err!(Table))?;
                let existed = ports.remove(port).map_err(map_err!(Write))?.is_some();
                if !existed {
                    debug!(%key, port, "port row already released");
                }
            } else {
                warn!(%key, "entity had no port recorded, nothing to release");
            }
            port
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ?port, "instance entity deleted");
        Ok(())
    }

    /// Remove every mirror row and port row that no live instance accounts
    /// for.
    ///
    /// `live` maps each live instance's `{namespace}/{name}` key to its
    /// port. Both tables are pruned in one write transaction.
    pub fn retain_live(&self, live: &HashMap<String, u16>) -> StateResult<PruneReport> {
        let live_ports: HashSet<u16> = live.values().copied().collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let report = {
            let mut entities = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
            let mut stale_rows = Vec::new();
            for entry in entities.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if !live.contains_key(key.value()) {
                    stale_rows.push(key.value().to_string());
                }
            }
            for key in &stale_rows {
                entities.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut ports = txn.open_table(PORTS).map_err(map_err!(Table))?;
            let mut stale_ports = Vec::new();
            for entry in ports.iter().map_err(map_err!(Read))? {
                let (port, _) = entry.map_err(map_err!(Read))?;
                if !live_ports.contains(&port.value()) {
                    stale_ports.push(port.value());
                }
            }
            for port in &stale_ports {
                ports.remove(*port).map_err(map_err!(Write))?;
            }

            PruneReport {
                rows: stale_rows.len(),
                ports: stale_ports.len(),
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rows = report.rows, ports = report.ports, "pruned entries without a live instance");
        Ok(report)
    }

    // ── Port registry ──────────────────────────────────────────────

    /// Conditionally insert a port registry row.
    ///
    /// Fails with `Conflict` if a row for `port` already exists.
    pub fn insert_port(&self, port: u16) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            if table.get(port).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("port {port}")));
            }
            table.insert(port, epoch_secs()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Remove a port registry row. Returns true if it existed.
    pub fn remove_port(&self, port: u16) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            existed = table.remove(port).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Whether a registry row exists for `port`.
    pub fn port_in_use(&self, port: u16) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        Ok(table.get(port).map_err(map_err!(Read))?.is_some())
    }

    /// All ports currently registered, ascending.
    pub fn list_ports(&self) -> StateResult<Vec<u16>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            results.push(key.value());
        }
        Ok(results)
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
