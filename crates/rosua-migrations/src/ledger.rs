use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rosua_common::{Error, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Storage format of `executed_at`, same as SQLite's `datetime('now')`.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One applied migration as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub executed_at: Option<DateTime<Utc>>,
    /// Milliseconds spent in `up()`.
    pub execution_time: Option<i64>,
}

impl MigrationRecord {
    /// Record for a migration that just finished after `elapsed`.
    pub fn completed(version: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            version: version.into(),
            executed_at: Some(Utc::now().trunc_subsecs(0)),
            execution_time: Some((elapsed.as_secs_f64() * 1000.0).round() as i64),
        }
    }
}

/// Access to the ledger table on a borrowed connection or transaction.
pub struct Ledger<'c> {
    conn: &'c Connection,
    table: &'c str,
}

impl<'c> Ledger<'c> {
    /// `table` is interpolated into SQL, so it must be a plain identifier.
    pub fn new(conn: &'c Connection, table: &'c str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self { conn, table })
    }

    pub fn exists(&self) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                params![self.table],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check ledger table: {e}")))
    }

    pub fn create(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                version VARCHAR(191) NOT NULL,
                executed_at DATETIME DEFAULT NULL,
                execution_time INTEGER DEFAULT NULL,
                PRIMARY KEY (version)
            );",
            self.table
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))
    }

    /// All recorded migrations keyed by version. Empty when the table has not
    /// been installed yet.
    pub fn applied(&self) -> Result<BTreeMap<String, MigrationRecord>> {
        if !self.exists()? {
            return Ok(BTreeMap::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT version, executed_at, execution_time FROM \"{}\" ORDER BY version ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut records = BTreeMap::new();
        for row in rows {
            let (version, executed_at, execution_time) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            let executed_at = executed_at.and_then(|raw| {
                let parsed = parse_datetime(&raw);
                if parsed.is_none() {
                    warn!("ledger row {version} has unreadable executed_at {raw:?}");
                }
                parsed
            });
            records.insert(
                version.clone(),
                MigrationRecord {
                    version,
                    executed_at,
                    execution_time,
                },
            );
        }
        Ok(records)
    }

    pub fn contains(&self, version: &str) -> Result<bool> {
        if !self.exists()? {
            return Ok(false);
        }
        self.conn
            .query_row(
                &format!(
                    "SELECT count(*) > 0 FROM \"{}\" WHERE version = ?1",
                    self.table
                ),
                params![version],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to look up {version}: {e}")))
    }

    pub fn insert(&self, record: &MigrationRecord) -> Result<()> {
        let executed_at = record
            .executed_at
            .map(|at| at.format(DATETIME_FORMAT).to_string());
        self.conn
            .execute(
                &format!(
                    "INSERT INTO \"{}\" (version, executed_at, execution_time) VALUES (?1, ?2, ?3)",
                    self.table
                ),
                params![record.version, executed_at, record.execution_time],
            )
            .map_err(|e| {
                Error::Database(format!("failed to record {}: {e}", record.version))
            })?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        if !self.exists()? {
            return Ok(0);
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", self.table), [], |row| {
                row.get(0)
            })
            .map_err(|e| Error::Database(format!("failed to count ledger rows: {e}")))?;
        Ok(count as usize)
    }
}

/// Ledger names are restricted to `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "ledger table name {table:?} is not a plain SQL identifier"
        )));
    }
    Ok(())
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
                .map(|naive| naive.and_utc())
                .ok()
        })
}
