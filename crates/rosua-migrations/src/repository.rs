use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rosua_common::{Error, Result};
use rosua_config::MigrationConfig;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ledger::Ledger;
use crate::migration::{Migration, SqlMigration, validate_version};
use crate::registry::MigrationRegistry;

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// A discovered version paired with its ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub version: String,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
}

/// A definition that was found but cannot be run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedMigration {
    /// File name or version that was rejected.
    pub name: String,
    pub reason: String,
}

/// Statuses and rejects taken from one discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationListing {
    pub entries: Vec<MigrationStatusEntry>,
    pub rejected: Vec<RejectedMigration>,
}

#[derive(Debug, Clone)]
enum Definition {
    Registered,
    Sql { up: PathBuf, down: Option<PathBuf> },
}

/// Result of one discovery pass: runnable definitions in version order plus
/// everything that had to be skipped.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    definitions: BTreeMap<String, Definition>,
    rejected: Vec<RejectedMigration>,
}

impl Scan {
    /// Discovered versions, ascending.
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn rejected(&self) -> &[RejectedMigration] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn reject(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let rejected = RejectedMigration {
            name: name.into(),
            reason: reason.into(),
        };
        warn!("skipping migration {}: {}", rejected.name, rejected.reason);
        self.rejected.push(rejected);
    }
}

/// Finds migration definitions for one configured namespace and directory
/// and classifies them against the ledger.
pub struct MigrationRepository<'a> {
    config: &'a MigrationConfig,
    registry: &'a MigrationRegistry,
}

impl<'a> MigrationRepository<'a> {
    pub fn new(config: &'a MigrationConfig, registry: &'a MigrationRegistry) -> Self {
        Self { config, registry }
    }

    /// Collect registered and on-disk definitions. Registered migrations win
    /// over a file carrying the same version.
    pub fn scan(&self) -> Result<Scan> {
        let mut scan = Scan::default();

        for version in self.registry.versions(self.config.namespace()) {
            scan.definitions
                .insert(version.to_string(), Definition::Registered);
        }

        let dir = self.config.migrations_path();
        let mut files: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
        for path in list_sql_files(&dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                scan.reject(
                    path.display().to_string(),
                    "file name is not valid UTF-8",
                );
                continue;
            };

            let (version, is_up) = if let Some(version) = name.strip_suffix(UP_SUFFIX) {
                (version, true)
            } else if let Some(version) = name.strip_suffix(DOWN_SUFFIX) {
                (version, false)
            } else {
                scan.reject(name, "expected <version>.up.sql or <version>.down.sql");
                continue;
            };

            if let Err(e) = validate_version(version) {
                scan.reject(name, e.to_string());
                continue;
            }

            let slot = files.entry(version.to_string()).or_default();
            if is_up {
                slot.0 = Some(path.clone());
            } else {
                slot.1 = Some(path.clone());
            }
        }

        for (version, (up, down)) in files {
            let Some(up) = up else {
                scan.reject(&version, "down script without an up script");
                continue;
            };
            if scan.definitions.contains_key(&version) {
                scan.reject(
                    &version,
                    format!("{} duplicates a registered migration", up.display()),
                );
                continue;
            }
            scan.definitions.insert(version, Definition::Sql { up, down });
        }

        debug!(
            "discovered {} migrations in {} ({} rejected)",
            scan.len(),
            dir.display(),
            scan.rejected.len()
        );
        Ok(scan)
    }

    /// Pair each scanned version with its ledger row, ascending by version.
    pub fn statuses(&self, scan: &Scan, conn: &Connection) -> Result<Vec<MigrationStatusEntry>> {
        let table = self.config.ledger_table();
        let applied = Ledger::new(conn, &table)?.applied()?;

        Ok(scan
            .versions()
            .map(|version| {
                let record = applied.get(version);
                MigrationStatusEntry {
                    version: version.to_string(),
                    executed: record.is_some(),
                    executed_at: record.and_then(|r| r.executed_at),
                }
            })
            .collect())
    }

    /// Scan and classify in one step.
    pub fn migration_versions(&self, conn: &Connection) -> Result<Vec<MigrationStatusEntry>> {
        let scan = self.scan()?;
        self.statuses(&scan, conn)
    }

    /// Statuses plus the definitions the same scan rejected.
    pub fn listing(&self, conn: &Connection) -> Result<MigrationListing> {
        let scan = self.scan()?;
        let entries = self.statuses(&scan, conn)?;
        Ok(MigrationListing {
            entries,
            rejected: scan.rejected,
        })
    }

    /// Build a runnable instance of a scanned version.
    pub fn instantiate(&self, scan: &Scan, version: &str) -> Result<Box<dyn Migration>> {
        match scan.definitions.get(version) {
            Some(Definition::Registered) => {
                self.registry.instantiate(self.config.namespace(), version)
            }
            Some(Definition::Sql { up, down }) => Ok(Box::new(SqlMigration::load(
                version,
                up,
                down.as_deref(),
            )?)),
            None => Err(Error::NotFound(format!("migration {version}"))),
        }
    }
}

/// `*.sql` files directly under `dir`. A missing directory has no migrations.
fn list_sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        debug!("migration directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Filesystem(format!("failed to read {}: {e}", dir.display())))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| Error::Filesystem(format!("failed to read {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    Ok(files)
}
