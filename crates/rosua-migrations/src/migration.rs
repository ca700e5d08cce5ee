use std::path::Path;

use rosua_common::{Error, Result};
use rusqlite::Connection;

/// Upper bound on a version identifier; it is the ledger's primary key and
/// the column is `VARCHAR(191)`.
pub const MAX_VERSION_LEN: usize = 191;

/// A unit of schema or data change.
///
/// Instances are created right before they run and dropped afterwards.
pub trait Migration {
    /// Identifier recorded in the ledger. Must sort after every migration
    /// this one depends on.
    fn version(&self) -> &str;

    /// Apply the change.
    fn up(&self, conn: &Connection) -> Result<()>;

    /// Whether `up` may run inside a transaction opened by the migrator.
    /// Return `false` for bodies that begin or commit their own transactions
    /// or change connection state that SQLite ignores inside a transaction,
    /// such as `PRAGMA foreign_keys`.
    fn transactional(&self) -> bool {
        true
    }

    /// Revert the change. Never invoked by the migrator.
    fn down(&self, _conn: &Connection) -> Result<()> {
        Err(Error::InvalidMigration(format!(
            "{} has no down step",
            self.version()
        )))
    }
}

/// Check that `version` can be stored in the ledger and orders predictably:
/// ASCII alphanumerics and `_` only, a leading digit, at most
/// [`MAX_VERSION_LEN`] bytes.
pub fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() {
        return Err(Error::InvalidMigration("version cannot be empty".into()));
    }
    if version.len() > MAX_VERSION_LEN {
        return Err(Error::InvalidMigration(format!(
            "version {version} is longer than {MAX_VERSION_LEN} characters"
        )));
    }
    if !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::InvalidMigration(format!(
            "version {version} must start with a digit"
        )));
    }
    if let Some(bad) = version
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(Error::InvalidMigration(format!(
            "version {version} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Statements that either control transactions themselves or are ignored
/// or refused by SQLite inside an open transaction.
const CONNECTION_LEVEL_KEYWORDS: [&str; 10] = [
    "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE", "PRAGMA", "VACUUM", "ATTACH",
    "DETACH",
];

/// Whether `sql` contains a statement from [`CONNECTION_LEVEL_KEYWORDS`].
/// The `BEGIN ... END` body of a `CREATE TRIGGER` does not count.
pub fn controls_connection(sql: &str) -> bool {
    let stripped = strip_comments(sql);
    let mut in_trigger = false;

    for statement in stripped.split(';') {
        let mut words = statement.split_whitespace().map(str::to_ascii_uppercase);
        let Some(first) = words.next() else {
            continue;
        };

        if in_trigger {
            if first == "END" {
                in_trigger = false;
            }
            continue;
        }
        if first == "CREATE" && words.take(3).any(|w| w == "TRIGGER") {
            in_trigger = true;
            continue;
        }
        if CONNECTION_LEVEL_KEYWORDS.contains(&first.as_str()) {
            return true;
        }
    }
    false
}

fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
            out.push(' ');
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}

/// A migration backed by plain SQL scripts.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    version: String,
    up_sql: String,
    down_sql: Option<String>,
    transactional: bool,
}

impl SqlMigration {
    pub fn new(version: impl Into<String>, up_sql: impl Into<String>, down_sql: Option<String>) -> Self {
        let up_sql = up_sql.into();
        Self {
            version: version.into(),
            transactional: !controls_connection(&up_sql),
            up_sql,
            down_sql,
        }
    }

    /// Read the `up` script and, when present, the `down` script.
    pub fn load(version: &str, up_path: &Path, down_path: Option<&Path>) -> Result<Self> {
        let up_sql = read_script(up_path)?;
        let down_sql = down_path.map(read_script).transpose()?;
        Ok(Self::new(version, up_sql, down_sql))
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Filesystem(format!("failed to read {}: {e}", path.display())))
}

impl Migration for SqlMigration {
    fn version(&self) -> &str {
        &self.version
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.up_sql)
            .map_err(|e| Error::Database(format!("up script failed: {e}")))
    }

    fn transactional(&self) -> bool {
        self.transactional
    }

    fn down(&self, conn: &Connection) -> Result<()> {
        match &self.down_sql {
            Some(sql) => conn
                .execute_batch(sql)
                .map_err(|e| Error::Database(format!("down script failed: {e}"))),
            None => Err(Error::InvalidMigration(format!(
                "{} has no down script",
                self.version
            ))),
        }
    }
}
