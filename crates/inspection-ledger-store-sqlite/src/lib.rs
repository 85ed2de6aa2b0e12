use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use inspection_ledger_core::{
    CollectionName, HistoryIter, KeyModification, KeyValue, KeyValueIter, LedgerStore, Selector,
    StoreError, TxTimestamp,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS transactions (
  tx_id TEXT PRIMARY KEY,
  namespace TEXT NOT NULL,
  tx_seconds INTEGER NOT NULL,
  tx_nanos INTEGER NOT NULL CHECK (tx_nanos >= 0 AND tx_nanos < 1000000000)
);

CREATE TABLE IF NOT EXISTS world_state (
  namespace TEXT NOT NULL,
  state_key TEXT NOT NULL,
  value BLOB NOT NULL,
  tx_id TEXT NOT NULL REFERENCES transactions(tx_id),
  PRIMARY KEY (namespace, state_key)
);

CREATE TABLE IF NOT EXISTS private_data (
  namespace TEXT NOT NULL,
  collection TEXT NOT NULL,
  state_key TEXT NOT NULL,
  value BLOB NOT NULL,
  tx_id TEXT NOT NULL REFERENCES transactions(tx_id),
  PRIMARY KEY (namespace, collection, state_key)
);

CREATE TABLE IF NOT EXISTS key_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  namespace TEXT NOT NULL,
  state_key TEXT NOT NULL,
  tx_id TEXT NOT NULL REFERENCES transactions(tx_id),
  is_delete INTEGER NOT NULL CHECK (is_delete IN (0, 1)),
  value BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_key_history_key ON key_history(namespace, state_key, seq);
CREATE INDEX IF NOT EXISTS idx_private_data_key ON private_data(namespace, state_key);
";

pub struct SqliteLedger {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Private halves whose public half is absent.
    pub orphaned_private_entries: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteLedger {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "world_state")? {
                // Tables exist but the migration was never recorded.
                record_schema_version(&self.conn, 1)?;
            } else {
                self.apply_migration_1()?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        info!(version = 1, "applied ledger schema migration");
        Ok(())
    }

    /// Start one invocation against `namespace`. Nothing it writes is visible to
    /// other connections until [`SqliteInvocation::commit`]; dropping it rolls back.
    ///
    /// # Errors
    /// Returns an error when the write transaction cannot be started.
    pub fn begin(&mut self, namespace: &str) -> Result<SqliteInvocation<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ledger transaction")?;
        let tx_id = Ulid::new().to_string();
        debug!(namespace, tx_id = %tx_id, "ledger transaction started");
        Ok(SqliteInvocation {
            tx,
            namespace: namespace.to_string(),
            tx_id,
            timestamp: TxTimestamp::now(),
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, orphan, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let orphaned_private_entries = if table_exists(&self.conn, "private_data")? {
            self.conn
                .query_row(
                    "SELECT COUNT(*) FROM private_data p
                     WHERE NOT EXISTS (
                       SELECT 1 FROM world_state w
                       WHERE w.namespace = p.namespace AND w.state_key = p.state_key
                     )",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to count orphaned private entries")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            orphaned_private_entries,
            schema_status,
        })
    }
}

/// A single ledger invocation: one `SQLite` transaction scoped to a namespace.
pub struct SqliteInvocation<'c> {
    tx: Transaction<'c>,
    namespace: String,
    tx_id: String,
    timestamp: TxTimestamp,
}

impl SqliteInvocation<'_> {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// # Errors
    /// Returns an error when the transaction cannot be committed.
    pub fn commit(self) -> Result<()> {
        let tx_id = self.tx_id;
        self.tx
            .commit()
            .with_context(|| format!("failed to commit ledger transaction {tx_id}"))?;
        debug!(tx_id = %tx_id, "ledger transaction committed");
        Ok(())
    }

    /// Remove the public half of `key` and log a deletion marker. Returns
    /// whether the key existed.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn delete_public(&mut self, key: &str) -> Result<bool> {
        let removed = self
            .tx
            .execute(
                "DELETE FROM world_state WHERE namespace = ?1 AND state_key = ?2",
                params![self.namespace, key],
            )
            .with_context(|| format!("failed to delete world state key {key}"))?;
        if removed == 0 {
            return Ok(false);
        }
        self.register_transaction()?;
        self.append_history(key, true, &[])?;
        Ok(true)
    }

    fn register_transaction(&self) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO transactions(tx_id, namespace, tx_seconds, tx_nanos)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.tx_id,
                    self.namespace,
                    self.timestamp.seconds,
                    i64::from(self.timestamp.nanos)
                ],
            )
            .context("failed to register ledger transaction")?;
        Ok(())
    }

    fn append_history(&self, key: &str, is_delete: bool, value: &[u8]) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO key_history(namespace, state_key, tx_id, is_delete, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![self.namespace, key, self.tx_id, i64::from(is_delete), value],
            )
            .with_context(|| format!("failed to append history for key {key}"))?;
        Ok(())
    }

    fn read_public(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.tx
            .query_row(
                "SELECT value FROM world_state WHERE namespace = ?1 AND state_key = ?2",
                params![self.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read world state key {key}"))
    }

    fn write_public(&self, key: &str, value: &[u8]) -> Result<()> {
        self.register_transaction()?;
        self.tx
            .execute(
                "INSERT INTO world_state(namespace, state_key, value, tx_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, state_key) DO UPDATE SET value = excluded.value, tx_id = excluded.tx_id",
                params![self.namespace, key, value, self.tx_id],
            )
            .with_context(|| format!("failed to write world state key {key}"))?;
        self.append_history(key, false, value)
    }

    fn read_private(&self, collection: &CollectionName, key: &str) -> Result<Option<Vec<u8>>> {
        self.tx
            .query_row(
                "SELECT value FROM private_data
                 WHERE namespace = ?1 AND collection = ?2 AND state_key = ?3",
                params![self.namespace, collection.as_str(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read private key {key} from {collection}"))
    }

    fn write_private(&self, collection: &CollectionName, key: &str, value: &[u8]) -> Result<()> {
        self.register_transaction()?;
        self.tx
            .execute(
                "INSERT INTO private_data(namespace, collection, state_key, value, tx_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(namespace, collection, state_key)
                 DO UPDATE SET value = excluded.value, tx_id = excluded.tx_id",
                params![self.namespace, collection.as_str(), key, value, self.tx_id],
            )
            .with_context(|| format!("failed to write private key {key} to {collection}"))?;
        Ok(())
    }

    fn scan_range(&self, start: &str, end: &str) -> Result<Vec<KeyValue>> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT state_key, value FROM world_state
                 WHERE namespace = ?1 AND state_key >= ?2 AND (?3 = '' OR state_key < ?3)
                 ORDER BY state_key ASC",
            )
            .context("failed to prepare range scan")?;
        let rows = stmt.query_map(params![self.namespace, start, end], |row| {
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to read range scan row")?);
        }
        Ok(entries)
    }

    fn select(&self, selector: &Selector) -> Result<Option<Vec<KeyValue>>> {
        let mut sql = String::from(
            "SELECT state_key, value FROM world_state
             WHERE namespace = ?",
        );
        let mut bound = vec![SqlValue::Text(self.namespace.clone())];
        for (field, expected) in selector.fields() {
            let Some(expected) = sql_scalar(expected) else {
                return Ok(None);
            };
            if field.contains('"') {
                return Ok(None);
            }
            sql.push_str(
                " AND CASE WHEN json_valid(CAST(value AS TEXT))
                   THEN json_extract(CAST(value AS TEXT), ?) END = ?",
            );
            bound.push(SqlValue::Text(format!("$.\"{field}\"")));
            bound.push(expected);
        }
        sql.push_str(" ORDER BY state_key ASC");

        let mut stmt = self.tx.prepare(&sql).context("failed to prepare rich query")?;
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to read rich query row")?);
        }
        Ok(Some(entries))
    }

    fn modifications(&self, key: &str) -> Result<Vec<KeyModification>> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT h.tx_id, t.tx_seconds, t.tx_nanos, h.is_delete, h.value
                 FROM key_history h
                 JOIN transactions t ON t.tx_id = h.tx_id
                 WHERE h.namespace = ?1 AND h.state_key = ?2
                 ORDER BY h.seq ASC",
            )
            .context("failed to prepare history query")?;
        let rows = stmt.query_map(params![self.namespace, key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut modifications = Vec::new();
        for row in rows {
            let (tx_id, seconds, nanos, is_delete, value) =
                row.with_context(|| format!("failed to read history row for key {key}"))?;
            let nanos = u32::try_from(nanos)
                .with_context(|| format!("invalid nanos {nanos} for transaction {tx_id}"))?;
            modifications.push(KeyModification {
                tx_id,
                timestamp: TxTimestamp { seconds, nanos },
                is_delete: is_delete != 0,
                value,
            });
        }
        Ok(modifications)
    }
}

impl LedgerStore for SqliteInvocation<'_> {
    fn get_public(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_public(key).map_err(store_error)
    }

    fn put_public(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.write_public(key, value).map_err(store_error)
    }

    fn get_private(
        &self,
        collection: &CollectionName,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_private(collection, key).map_err(store_error)
    }

    fn put_private(
        &mut self,
        collection: &CollectionName,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.write_private(collection, key, value).map_err(store_error)
    }

    fn range_scan(&self, start: &str, end: &str) -> Result<KeyValueIter<'_>, StoreError> {
        let entries = self.scan_range(start, end).map_err(store_error)?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn rich_query(&self, selector: &Selector) -> Result<Option<KeyValueIter<'_>>, StoreError> {
        let Some(entries) = self.select(selector).map_err(store_error)? else {
            return Ok(None);
        };
        let entries: KeyValueIter<'_> = Box::new(entries.into_iter().map(Ok));
        Ok(Some(entries))
    }

    fn history_of(&self, key: &str) -> Result<HistoryIter<'_>, StoreError> {
        let modifications = self.modifications(key).map_err(store_error)?;
        Ok(Box::new(modifications.into_iter().map(Ok)))
    }

    fn tx_id(&self) -> &str {
        &self.tx_id
    }

    fn tx_timestamp(&self) -> TxTimestamp {
        self.timestamp
    }
}

fn store_error(err: anyhow::Error) -> StoreError {
    StoreError::new(format!("{err:#}"))
}

fn sql_scalar(value: &JsonValue) -> Option<SqlValue> {
    match value {
        JsonValue::String(text) => Some(SqlValue::Text(text.clone())),
        JsonValue::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        JsonValue::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real)),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "world_state")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
