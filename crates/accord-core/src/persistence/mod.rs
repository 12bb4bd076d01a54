//! The embedded store.
//!
//! One SQLite database per worker process, WAL mode, partitioned into
//! typed buckets: agreements, archived agreements, service definitions
//! and instances, attributes, the node record, and the operator event
//! log. Records are canonical JSON; accessors enforce the lifecycle
//! invariants (an archived agreement never mutates again, archived
//! records must carry their termination facts).

pub mod records;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::agreement::{Agreement, AgreementState};
use crate::attributes::Attribute;
use crate::service::{ServiceDefinition, ServiceInstance};
use records::{EventLogRecord, LogSeverity, NodeRecord};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record did not demarshal.
    #[error("corrupt record in bucket '{bucket}': {source}")]
    CorruptRecord {
        /// Bucket the record came from.
        bucket: &'static str,
        /// Parser diagnostic.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized for storage.
    #[error("cannot serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Attempted to mutate an archived agreement.
    #[error("agreement {agreement_id} is archived and immutable")]
    Archived {
        /// Agreement id.
        agreement_id: String,
    },

    /// Attempted to archive an agreement that is not finished.
    #[error("agreement {agreement_id} is not ready to archive")]
    NotArchivable {
        /// Agreement id.
        agreement_id: String,
    },

    /// The requested record does not exist.
    #[error("no such record: {what}")]
    NotFound {
        /// Description of the missing record.
        what: String,
    },
}

/// The embedded store handle, shared across workers.
///
/// `SQLite` serializes writes internally; the mutex keeps our use of the
/// single connection coherent.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (and migrates) the store at the given path.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] when the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // WAL keeps readers unblocked during writes. The pragma returns a
        // row, so it goes through query_row rather than execute.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] when the database cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ---- agreements -----------------------------------------------------

    /// Inserts or updates a live agreement record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Archived`] when the id is already archived; storage
    /// errors otherwise.
    pub fn save_agreement(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let conn = self.lock();
        let archived: Option<String> = conn
            .query_row(
                "SELECT agreement_id FROM archived_agreements WHERE agreement_id = ?1",
                params![agreement.id],
                |row| row.get(0),
            )
            .optional()?;
        if archived.is_some() {
            return Err(StoreError::Archived {
                agreement_id: agreement.id.clone(),
            });
        }
        let record = serde_json::to_string(agreement)?;
        conn.execute(
            "INSERT INTO agreements (agreement_id, record) VALUES (?1, ?2)
             ON CONFLICT(agreement_id) DO UPDATE SET record = excluded.record",
            params![agreement.id, record],
        )?;
        Ok(())
    }

    /// Looks up a live agreement.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn find_agreement(&self, agreement_id: &str) -> Result<Option<Agreement>, StoreError> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM agreements WHERE agreement_id = ?1",
                params![agreement_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| {
                serde_json::from_str(&r).map_err(|source| StoreError::CorruptRecord {
                    bucket: "agreements",
                    source,
                })
            })
            .transpose()
    }

    /// All live agreements.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn agreements(&self) -> Result<Vec<Agreement>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT record FROM agreements ORDER BY agreement_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            out.push(serde_json::from_str(&record).map_err(|source| {
                StoreError::CorruptRecord {
                    bucket: "agreements",
                    source,
                }
            })?);
        }
        Ok(out)
    }

    /// Moves a finished agreement into the archive bucket.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotArchivable`] unless the record is in the
    /// `Archived` state with its termination facts recorded.
    pub fn archive_agreement(&self, agreement: &Agreement) -> Result<(), StoreError> {
        if agreement.state != AgreementState::Archived
            || agreement.terminated == 0
            || agreement.terminated_reason == 0
        {
            return Err(StoreError::NotArchivable {
                agreement_id: agreement.id.clone(),
            });
        }
        let record = serde_json::to_string(agreement)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO archived_agreements (agreement_id, record) VALUES (?1, ?2)
             ON CONFLICT(agreement_id) DO UPDATE SET record = excluded.record",
            params![agreement.id, record],
        )?;
        tx.execute(
            "DELETE FROM agreements WHERE agreement_id = ?1",
            params![agreement.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Looks up an archived agreement.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn find_archived(&self, agreement_id: &str) -> Result<Option<Agreement>, StoreError> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM archived_agreements WHERE agreement_id = ?1",
                params![agreement_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| {
                serde_json::from_str(&r).map_err(|source| StoreError::CorruptRecord {
                    bucket: "archivedAgreements",
                    source,
                })
            })
            .transpose()
    }

    // ---- service definitions and instances ------------------------------

    /// Inserts or updates a service definition.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save_service_def(&self, def: &ServiceDefinition) -> Result<(), StoreError> {
        let record = serde_json::to_string(def)?;
        self.lock().execute(
            "INSERT INTO service_defs (id, record) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![def.id, record],
        )?;
        Ok(())
    }

    /// All service definitions.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn service_defs(&self) -> Result<Vec<ServiceDefinition>, StoreError> {
        self.read_bucket("service_defs", "SELECT record FROM service_defs ORDER BY id")
    }

    /// Inserts or updates a service instance.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save_service_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError> {
        let record = serde_json::to_string(instance)?;
        self.lock().execute(
            "INSERT INTO service_instances (instance_id, record) VALUES (?1, ?2)
             ON CONFLICT(instance_id) DO UPDATE SET record = excluded.record",
            params![instance.instance_id, record],
        )?;
        Ok(())
    }

    /// Removes a service instance.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn delete_service_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "DELETE FROM service_instances WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    /// All service instances.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn service_instances(&self) -> Result<Vec<ServiceInstance>, StoreError> {
        self.read_bucket(
            "service_instances",
            "SELECT record FROM service_instances ORDER BY instance_id",
        )
    }

    // ---- attributes -----------------------------------------------------

    /// Inserts or updates an attribute.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save_attribute(&self, attribute: &Attribute) -> Result<(), StoreError> {
        let record = serde_json::to_string(attribute)?;
        self.lock().execute(
            "INSERT INTO attributes (id, record) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![attribute.id, record],
        )?;
        Ok(())
    }

    /// Deletes an attribute.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no such attribute exists.
    pub fn delete_attribute(&self, id: &str) -> Result<(), StoreError> {
        let n = self
            .lock()
            .execute("DELETE FROM attributes WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("attribute {id}"),
            });
        }
        Ok(())
    }

    /// All attributes.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn attributes(&self) -> Result<Vec<Attribute>, StoreError> {
        self.read_bucket("attributes", "SELECT record FROM attributes ORDER BY id")
    }

    // ---- node record ----------------------------------------------------

    /// Stores the node record (the single row).
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let record = serde_json::to_string(node)?;
        self.lock().execute(
            "INSERT INTO node (id, record) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![record],
        )?;
        Ok(())
    }

    /// Reads the node record, if the node has registered.
    ///
    /// # Errors
    ///
    /// Storage or demarshal errors.
    pub fn find_node(&self) -> Result<Option<NodeRecord>, StoreError> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row("SELECT record FROM node WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        record
            .map(|r| {
                serde_json::from_str(&r).map_err(|source| StoreError::CorruptRecord {
                    bucket: "node",
                    source,
                })
            })
            .transpose()
    }

    /// Removes the node record.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn delete_node(&self) -> Result<(), StoreError> {
        self.lock().execute("DELETE FROM node WHERE id = 1", [])?;
        Ok(())
    }

    // ---- event log ------------------------------------------------------

    /// Appends an event log record and returns its assigned id.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn log_event(
        &self,
        timestamp: u64,
        severity: LogSeverity,
        category: &str,
        message: &str,
    ) -> Result<u64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO event_log (timestamp, severity, category, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![timestamp as i64, severity.as_str(), category, message],
        )?;
        #[allow(clippy::cast_sign_loss)]
        let record_id = conn.last_insert_rowid() as u64;
        Ok(record_id)
    }

    /// Reads event log records with ids greater than `after`, oldest
    /// first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn event_log(&self, after: u64, limit: u32) -> Result<Vec<EventLogRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT record_id, timestamp, severity, category, message
             FROM event_log WHERE record_id > ?1
             ORDER BY record_id ASC LIMIT ?2",
        )?;
        #[allow(clippy::cast_sign_loss)]
        let rows = stmt.query_map(params![after as i64, limit], |row| {
            Ok(EventLogRecord {
                record_id: row.get::<_, i64>(0)? as u64,
                timestamp: row.get::<_, i64>(1)? as u64,
                severity: match row.get::<_, String>(2)?.as_str() {
                    "ERROR" => LogSeverity::Error,
                    "WARN" => LogSeverity::Warn,
                    _ => LogSeverity::Info,
                },
                category: row.get(3)?,
                message: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn read_bucket<T: serde::de::DeserializeOwned>(
        &self,
        bucket: &'static str,
        sql: &str,
    ) -> Result<Vec<T>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            out.push(
                serde_json::from_str(&record)
                    .map_err(|source| StoreError::CorruptRecord { bucket, source })?,
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::records::ConfigState;
    use super::*;
    use crate::agreement::AgreementRole;
    use crate::policy::workload::Workload;

    fn agreement(id: &str) -> Agreement {
        Agreement::new(
            id.to_string(),
            AgreementRole::Consumer,
            "accord-basic",
            2,
            "myorg/node1",
            "workload-svcA",
            "myorg",
            "{}".into(),
            "00".repeat(32),
            "{}".into(),
            Workload::default(),
            1_700_000_000,
        )
    }

    fn finished(id: &str) -> Agreement {
        let mut a = agreement(id);
        a.mark_terminating(1_700_000_100, 201, "no reply").unwrap();
        a.mark_archived(1_700_000_200).unwrap();
        a
    }

    #[test]
    fn test_agreement_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let a = agreement(&"ab".repeat(16));
        store.save_agreement(&a).unwrap();
        assert_eq!(store.find_agreement(&a.id).unwrap().unwrap(), a);
        assert_eq!(store.agreements().unwrap().len(), 1);
    }

    #[test]
    fn test_archive_moves_record() {
        let store = Store::open_in_memory().unwrap();
        let a = finished(&"ab".repeat(16));
        store.save_agreement(&agreement(&a.id)).unwrap();
        store.archive_agreement(&a).unwrap();

        assert!(store.find_agreement(&a.id).unwrap().is_none());
        assert_eq!(store.find_archived(&a.id).unwrap().unwrap().id, a.id);
        // Archived ids never come back to life.
        assert!(matches!(
            store.save_agreement(&agreement(&a.id)),
            Err(StoreError::Archived { .. })
        ));
    }

    #[test]
    fn test_archive_rejects_unfinished() {
        let store = Store::open_in_memory().unwrap();
        let a = agreement(&"cd".repeat(16));
        assert!(matches!(
            store.archive_agreement(&a),
            Err(StoreError::NotArchivable { .. })
        ));
    }

    #[test]
    fn test_node_record_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.find_node().unwrap().is_none());
        let node = NodeRecord {
            org: "myorg".into(),
            id: "node1".into(),
            name: "edge node".into(),
            token: "secret".into(),
            pattern: Some("myorg/edge-pattern".into()),
            config_state: ConfigState::Configuring,
        };
        store.save_node(&node).unwrap();
        assert_eq!(store.find_node().unwrap().unwrap(), node);
        store.delete_node().unwrap();
        assert!(store.find_node().unwrap().is_none());
    }

    #[test]
    fn test_event_log_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .log_event(1, LogSeverity::Info, "agreement", "created")
            .unwrap();
        let second = store
            .log_event(2, LogSeverity::Error, "database", "boom")
            .unwrap();
        assert!(second > first);

        let records = store.event_log(0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, first);
        assert_eq!(records[1].severity, LogSeverity::Error);

        let after = store.event_log(first, 10).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].record_id, second);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accord.db");
        {
            let store = Store::open(&path).unwrap();
            store.save_agreement(&agreement(&"ef".repeat(16))).unwrap();
            store
                .log_event(1, LogSeverity::Info, "agreement", "created")
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.agreements().unwrap().len(), 1);
        assert_eq!(store.event_log(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_attribute_delete_missing() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.delete_attribute("nope"),
            Err(StoreError::NotFound { .. })
        ));
    }
}
