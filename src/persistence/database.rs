//! SQLite database implementation for persistent instance state

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use crate::core::{Instance, InstanceConfig, InstanceId, InstanceStatus};
use crate::error::{Error, Result};

/// Transient-failure retry budget for committed reads and maintenance
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// One audit-trail entry for a lifecycle transition
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub id: i64,
    pub instance_id: InstanceId,
    pub from_status: Option<InstanceStatus>,
    pub to_status: InstanceStatus,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Database wrapper for SQLite operations.
///
/// All mutations flow through [`Database::with_transaction`] so multi-step
/// updates become visible atomically; reads outside a transaction observe
/// only committed state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if necessary) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StoreUnavailable(format!("cannot create {parent:?}: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::StoreUnavailable(format!("failed to open database at {path:?}: {e}")))?;

        // WAL mode for concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_store_err)?;

        info!("database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the schema.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL,
                port INTEGER NOT NULL,
                container_id TEXT,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_name ON instances (name);
            CREATE INDEX IF NOT EXISTS idx_instances_status ON instances (status);
            CREATE INDEX IF NOT EXISTS idx_events_instance ON lifecycle_events (instance_id);
            CREATE INDEX IF NOT EXISTS idx_events_created ON lifecycle_events (created_at);
            "#,
        )
        .map_err(map_store_err)?;

        info!("database schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("database lock poisoned: {e}")))
    }

    /// Run `f` inside a transaction. All writes made through the passed
    /// handle commit atomically when `f` returns `Ok`; any error rolls the
    /// whole transaction back and is propagated unchanged.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_store_err)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(map_store_err)?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }

    /// Retry transient store failures a bounded number of times before
    /// surfacing them. Permanent errors propagate immediately.
    fn retrying<T>(&self, op: &str, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=RETRY_ATTEMPTS {
            let result = {
                let conn = self.lock()?;
                f(&conn)
            };
            match result {
                Err(e @ Error::StoreUnavailable(_)) if attempt < RETRY_ATTEMPTS => {
                    warn!("{op} failed on attempt {attempt}, retrying: {e}");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                other => return other,
            }
        }
        unreachable!("retry loop always returns on the final attempt")
    }

    // === Transaction-scope writes ===

    /// Insert a new instance record. A uniqueness violation on the name
    /// aborts the transaction with [`Error::DuplicateName`].
    pub fn insert_instance(tx: &Transaction<'_>, instance: &Instance) -> Result<()> {
        let config_json = serde_json::to_string(&instance.config)
            .map_err(|e| Error::Unknown(format!("failed to serialize instance config: {e}")))?;

        tx.execute(
            r#"
            INSERT INTO instances (id, name, status, port, container_id, config, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                instance.id.to_string(),
                instance.name,
                instance.status.label(),
                instance.port,
                instance.container_id,
                config_json,
                instance.created_at.to_rfc3339(),
                instance.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateName(instance.name.clone())
            } else {
                map_store_err(e)
            }
        })?;

        debug!("instance {} inserted", instance.id);
        Ok(())
    }

    /// Update an instance's status.
    pub fn update_status(tx: &Transaction<'_>, id: InstanceId, status: InstanceStatus) -> Result<()> {
        let changed = tx
            .execute(
                "UPDATE instances SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.label(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(map_store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    /// Attach a container handle and set the status in one step.
    pub fn attach_container(
        tx: &Transaction<'_>,
        id: InstanceId,
        container_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let changed = tx
            .execute(
                "UPDATE instances SET container_id = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    container_id,
                    status.label(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .map_err(map_store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    /// Remove an instance record.
    pub fn delete_record(tx: &Transaction<'_>, id: InstanceId) -> Result<()> {
        tx.execute("DELETE FROM instances WHERE id = ?1", params![id.to_string()])
            .map_err(map_store_err)?;
        debug!("instance {} record deleted", id);
        Ok(())
    }

    /// Append one audit-trail entry for a lifecycle transition.
    pub fn record_event(
        tx: &Transaction<'_>,
        id: InstanceId,
        from: Option<InstanceStatus>,
        to: InstanceStatus,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO lifecycle_events (instance_id, from_status, to_status, outcome, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id.to_string(),
                from.map(|s| s.label()),
                to.label(),
                outcome,
                detail,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(map_store_err)?;
        Ok(())
    }

    // === Committed reads ===

    /// Fetch an instance by id.
    pub fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        self.retrying("get_instance", |conn| {
            conn.query_row(
                "SELECT id, name, status, port, container_id, config, created_at, updated_at \
                 FROM instances WHERE id = ?1",
                params![id.to_string()],
                row_to_instance,
            )
            .optional()
            .map_err(map_store_err)?
            .transpose()
        })
    }

    /// Fetch an instance by its unique name.
    pub fn get_instance_by_name(&self, name: &str) -> Result<Option<Instance>> {
        self.retrying("get_instance_by_name", |conn| {
            conn.query_row(
                "SELECT id, name, status, port, container_id, config, created_at, updated_at \
                 FROM instances WHERE name = ?1",
                params![name],
                row_to_instance,
            )
            .optional()
            .map_err(map_store_err)?
            .transpose()
        })
    }

    /// All instance records, ordered by name.
    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        self.retrying("list_instances", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, status, port, container_id, config, created_at, updated_at \
                     FROM instances ORDER BY name",
                )
                .map_err(map_store_err)?;
            let rows = stmt.query_map([], row_to_instance).map_err(map_store_err)?;
            let mut instances = Vec::new();
            for row in rows {
                instances.push(row.map_err(map_store_err)??);
            }
            Ok(instances)
        })
    }

    /// Instance records currently in the given status.
    pub fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>> {
        self.retrying("list_by_status", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, status, port, container_id, config, created_at, updated_at \
                     FROM instances WHERE status = ?1 ORDER BY name",
                )
                .map_err(map_store_err)?;
            let rows = stmt
                .query_map(params![status.label()], row_to_instance)
                .map_err(map_store_err)?;
            let mut instances = Vec::new();
            for row in rows {
                instances.push(row.map_err(map_store_err)??);
            }
            Ok(instances)
        })
    }

    /// Read back the audit trail, newest first.
    pub fn events(&self, instance: Option<InstanceId>, limit: usize) -> Result<Vec<LifecycleEvent>> {
        self.retrying("events", |conn| {
            let mut events = Vec::new();
            match instance {
                Some(id) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, instance_id, from_status, to_status, outcome, detail, created_at \
                             FROM lifecycle_events WHERE instance_id = ?1 ORDER BY id DESC LIMIT ?2",
                        )
                        .map_err(map_store_err)?;
                    let rows = stmt
                        .query_map(params![id.to_string(), limit as i64], row_to_event)
                        .map_err(map_store_err)?;
                    for row in rows {
                        events.push(row.map_err(map_store_err)??);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, instance_id, from_status, to_status, outcome, detail, created_at \
                             FROM lifecycle_events ORDER BY id DESC LIMIT ?1",
                        )
                        .map_err(map_store_err)?;
                    let rows = stmt
                        .query_map(params![limit as i64], row_to_event)
                        .map_err(map_store_err)?;
                    for row in rows {
                        events.push(row.map_err(map_store_err)??);
                    }
                }
            }
            Ok(events)
        })
    }

    /// Delete audit entries older than the retention window. A retention
    /// of zero keeps everything.
    pub fn prune_events(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        self.retrying("prune_events", |conn| {
            let count = conn
                .execute(
                    "DELETE FROM lifecycle_events WHERE created_at < ?1",
                    params![cutoff],
                )
                .map_err(map_store_err)?;
            debug!("pruned {count} old lifecycle events");
            Ok(count)
        })
    }
}

type InstanceRow = (
    String,
    String,
    String,
    u16,
    Option<String>,
    String,
    String,
    String,
);

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Instance>> {
    let raw: InstanceRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    );
    Ok(decode_instance(raw))
}

fn decode_instance(raw: InstanceRow) -> Result<Instance> {
    let (id, name, status, port, container_id, config, created_at, updated_at) = raw;
    let config: InstanceConfig = serde_json::from_str(&config)
        .map_err(|e| Error::Unknown(format!("corrupt config for instance {id}: {e}")))?;
    Ok(Instance {
        id: InstanceId::parse(&id).map_err(|_| Error::Unknown(format!("corrupt instance id {id}")))?,
        name,
        config,
        status: InstanceStatus::parse(&status)?,
        port,
        container_id,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LifecycleEvent>> {
    let id: i64 = row.get(0)?;
    let instance_id: String = row.get(1)?;
    let from_status: Option<String> = row.get(2)?;
    let to_status: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let detail: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok((|| {
        Ok(LifecycleEvent {
            id,
            instance_id: InstanceId::parse(&instance_id)
                .map_err(|_| Error::Unknown(format!("corrupt event instance id {instance_id}")))?,
            from_status: from_status.as_deref().map(InstanceStatus::parse).transpose()?,
            to_status: InstanceStatus::parse(&to_status)?,
            outcome,
            detail,
            created_at: parse_timestamp(&created_at)?,
        })
    })())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Unknown(format!("corrupt timestamp '{raw}': {e}")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
    )
}

/// Map rusqlite failures into the engine taxonomy. Everything the caller
/// could not have prevented is a store availability problem.
fn map_store_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(err.to_string())
        }
        _ => Error::StoreUnavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InstanceConfig, VolumeMount};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_instance(name: &str, port: u16) -> Instance {
        let config = InstanceConfig::new("nginx:alpine")
            .with_env("MODE", "test")
            .with_volume(VolumeMount::new(format!("{name}-data"), "/data"));
        Instance::new(name, config, port)
    }

    #[test]
    fn insert_and_read_back() {
        let db = test_db();
        let instance = sample_instance("alpha", 6001);
        db.with_transaction(|tx| Database::insert_instance(tx, &instance))
            .unwrap();

        let loaded = db.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.port, 6001);
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.config, instance.config);

        let by_name = db.get_instance_by_name("alpha").unwrap().unwrap();
        assert_eq!(by_name.id, instance.id);
        assert!(db.get_instance_by_name("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_maps_to_typed_error() {
        let db = test_db();
        let first = sample_instance("taken", 6001);
        db.with_transaction(|tx| Database::insert_instance(tx, &first))
            .unwrap();

        let second = sample_instance("taken", 6002);
        let err = db
            .with_transaction(|tx| Database::insert_instance(tx, &second))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "taken"));
        assert_eq!(db.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn failed_transaction_rolls_back_all_steps() {
        let db = test_db();
        let instance = sample_instance("rollback", 6001);
        let err = db
            .with_transaction(|tx| {
                Database::insert_instance(tx, &instance)?;
                Database::record_event(
                    tx,
                    instance.id,
                    None,
                    InstanceStatus::Pending,
                    "ok",
                    None,
                )?;
                Err::<(), _>(Error::Unknown("injected".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Unknown(_)));

        // Neither the record nor the event survived.
        assert!(db.get_instance(instance.id).unwrap().is_none());
        assert!(db.events(None, 10).unwrap().is_empty());
    }

    #[test]
    fn status_updates_and_container_attach() {
        let db = test_db();
        let instance = sample_instance("beta", 6002);
        db.with_transaction(|tx| Database::insert_instance(tx, &instance))
            .unwrap();

        db.with_transaction(|tx| {
            Database::update_status(tx, instance.id, InstanceStatus::Creating)
        })
        .unwrap();
        db.with_transaction(|tx| {
            Database::attach_container(tx, instance.id, "deadbeef", InstanceStatus::Running)
        })
        .unwrap();

        let loaded = db.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.container_id.as_deref(), Some("deadbeef"));
        assert!(loaded.updated_at >= loaded.created_at);

        let running = db.list_by_status(InstanceStatus::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert!(db
            .list_by_status(InstanceStatus::Stopped)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn update_of_missing_instance_is_not_found() {
        let db = test_db();
        let err = db
            .with_transaction(|tx| {
                Database::update_status(tx, InstanceId::new(), InstanceStatus::Running)
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn event_trail_is_recorded_and_filtered() {
        let db = test_db();
        let a = sample_instance("inst-a", 6001);
        let b = sample_instance("inst-b", 6002);
        db.with_transaction(|tx| {
            Database::insert_instance(tx, &a)?;
            Database::insert_instance(tx, &b)?;
            Database::record_event(tx, a.id, None, InstanceStatus::Pending, "ok", None)?;
            Database::record_event(
                tx,
                a.id,
                Some(InstanceStatus::Pending),
                InstanceStatus::Creating,
                "ok",
                None,
            )?;
            Database::record_event(tx, b.id, None, InstanceStatus::Pending, "ok", None)
        })
        .unwrap();

        let all = db.events(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].instance_id, b.id);

        let only_a = db.events(Some(a.id), 10).unwrap();
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].to_status, InstanceStatus::Creating);
        assert_eq!(only_a[0].from_status, Some(InstanceStatus::Pending));
    }

    #[test]
    fn delete_removes_record_but_keeps_events() {
        let db = test_db();
        let instance = sample_instance("gone", 6003);
        db.with_transaction(|tx| {
            Database::insert_instance(tx, &instance)?;
            Database::record_event(tx, instance.id, None, InstanceStatus::Pending, "ok", None)
        })
        .unwrap();

        db.with_transaction(|tx| {
            Database::delete_record(tx, instance.id)?;
            Database::record_event(
                tx,
                instance.id,
                Some(InstanceStatus::Deleting),
                InstanceStatus::Deleted,
                "ok",
                None,
            )
        })
        .unwrap();

        assert!(db.get_instance(instance.id).unwrap().is_none());
        assert_eq!(db.events(Some(instance.id), 10).unwrap().len(), 2);
    }

    #[test]
    fn prune_zero_retention_keeps_everything() {
        let db = test_db();
        let instance = sample_instance("keep", 6004);
        db.with_transaction(|tx| {
            Database::insert_instance(tx, &instance)?;
            Database::record_event(tx, instance.id, None, InstanceStatus::Pending, "ok", None)
        })
        .unwrap();
        assert_eq!(db.prune_events(0).unwrap(), 0);
        assert_eq!(db.prune_events(30).unwrap(), 0);
        assert_eq!(db.events(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn opens_on_disk_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.initialize().unwrap();
            let instance = sample_instance("durable", 6005);
            db.with_transaction(|tx| Database::insert_instance(tx, &instance))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        assert_eq!(db.list_instances().unwrap().len(), 1);
    }
}
