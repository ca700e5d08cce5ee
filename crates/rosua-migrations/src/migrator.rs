use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use rosua_common::{Error, Result};
use rosua_config::MigrationConfig;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::generator::{GeneratedMigration, Generator};
use crate::ledger::{Ledger, MigrationRecord, validate_table_name};
use crate::migration::Migration;
use crate::registry::MigrationRegistry;
use crate::repository::{MigrationListing, MigrationRepository, MigrationStatusEntry, Scan};

/// How `execute` writes ledger rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingMode {
    /// Each migration runs in its own exclusive transaction together with
    /// its ledger row. A failure leaves earlier migrations recorded and rolls
    /// back the failing one.
    ///
    /// Migrations whose [`Migration::transactional`] is `false` (SQL scripts
    /// with their own `BEGIN`/`COMMIT`, `PRAGMA`, `VACUUM` or `ATTACH`) run
    /// on the bare connection and are recorded in a separate exclusive
    /// transaction afterwards. For those the ledger check is not held under
    /// the lock and a failure is not rolled back by the migrator.
    #[default]
    PerMigration,
    /// Run every pending body first, then insert all rows in one exclusive
    /// transaction. A failure records nothing for the whole call, although
    /// bodies that already ran keep their effects. Two concurrent callers can
    /// both see a version as pending.
    Batch,
}

/// Applies pending migrations to one SQLite database and tracks them in the
/// ledger table.
pub struct Migrator {
    config: MigrationConfig,
    table: String,
    conn: Mutex<Connection>,
    registry: MigrationRegistry,
    mode: RecordingMode,
}

impl Migrator {
    pub fn new(
        config: MigrationConfig,
        conn: Connection,
        registry: MigrationRegistry,
    ) -> Result<Self> {
        let table = config.ledger_table();
        validate_table_name(&table)?;
        Ok(Self {
            config,
            table,
            conn: Mutex::new(conn),
            registry,
            mode: RecordingMode::default(),
        })
    }

    pub fn open(
        config: MigrationConfig,
        db_path: &Path,
        registry: MigrationRegistry,
    ) -> Result<Self> {
        info!("opening migration target at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::new(config, conn, registry)
    }

    pub fn in_memory(config: MigrationConfig, registry: MigrationRegistry) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::new(config, conn, registry)
    }

    pub fn with_recording_mode(mut self, mode: RecordingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("migrator connection lock poisoned".into()))
    }

    fn repository(&self) -> MigrationRepository<'_> {
        MigrationRepository::new(&self.config, &self.registry)
    }

    /// Run `f` against the underlying connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }

    /// Create the ledger table unless it already exists. Returns whether it
    /// was created by this call; safe to run on every start.
    pub fn install(&self) -> Result<bool> {
        let conn = self.connection()?;
        let ledger = Ledger::new(&conn, &self.table)?;
        if ledger.exists()? {
            debug!("ledger table {} already installed", self.table);
            return Ok(false);
        }

        ledger.create()?;
        info!("created ledger table {}", self.table);
        Ok(true)
    }

    /// Discovery result including rejected definitions.
    pub fn scan(&self) -> Result<Scan> {
        self.repository().scan()
    }

    /// Every discovered version, ascending, with whether it has been applied.
    pub fn list(&self) -> Result<Vec<MigrationStatusEntry>> {
        let conn = self.connection()?;
        self.repository().migration_versions(&conn)
    }

    /// Statuses and rejected definitions from a single scan.
    pub fn listing(&self) -> Result<MigrationListing> {
        let conn = self.connection()?;
        self.repository().listing(&conn)
    }

    /// Apply all pending migrations in version order and return the ledger
    /// rows written. Stops at the first failing migration.
    pub fn execute(&self) -> Result<Vec<MigrationRecord>> {
        let repository = self.repository();
        let mut conn = self.connection()?;

        let scan = repository.scan()?;
        let pending: Vec<String> = repository
            .statuses(&scan, &conn)?
            .into_iter()
            .filter(|entry| !entry.executed)
            .map(|entry| entry.version)
            .collect();

        if pending.is_empty() {
            debug!("no pending migrations");
            return Ok(Vec::new());
        }

        if !Ledger::new(&conn, &self.table)?.exists()? {
            return Err(Error::Database(format!(
                "ledger table {} does not exist; run install first",
                self.table
            )));
        }

        match self.mode {
            RecordingMode::PerMigration => {
                self.execute_per_migration(&repository, &scan, &mut conn, &pending)
            }
            RecordingMode::Batch => self.execute_batch(&repository, &scan, &mut conn, &pending),
        }
    }

    fn execute_per_migration(
        &self,
        repository: &MigrationRepository<'_>,
        scan: &Scan,
        conn: &mut Connection,
        pending: &[String],
    ) -> Result<Vec<MigrationRecord>> {
        let mut executed = Vec::with_capacity(pending.len());

        for version in pending {
            let migration = repository
                .instantiate(scan, version)
                .map_err(|e| tag_failure(version, e))?;

            let applied = if migration.transactional() {
                self.apply_locked(conn, version, migration.as_ref())?
            } else {
                self.apply_unwrapped(conn, version, migration.as_ref())?
            };

            if let Some(record) = applied {
                info!(
                    "applied migration {version} in {}ms",
                    record.execution_time.unwrap_or_default()
                );
                executed.push(record);
            }
        }

        Ok(executed)
    }

    /// Body and ledger row share one exclusive transaction.
    fn apply_locked(
        &self,
        conn: &mut Connection,
        version: &str,
        migration: &dyn Migration,
    ) -> Result<Option<MigrationRecord>> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(|e| Error::Database(format!("failed to lock ledger: {e}")))?;
        let ledger = Ledger::new(&tx, &self.table)?;

        // Another process may have applied it since the ledger was read.
        if ledger.contains(version)? {
            debug!("migration {version} was recorded concurrently, skipping");
            return Ok(None);
        }

        let started = Instant::now();
        migration.up(&tx).map_err(|e| tag_failure(version, e))?;
        let record = MigrationRecord::completed(version, started.elapsed());
        ledger.insert(&record)?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit {version}: {e}")))?;
        Ok(Some(record))
    }

    /// The body runs on the bare connection, then its row is written in a
    /// short exclusive transaction.
    fn apply_unwrapped(
        &self,
        conn: &mut Connection,
        version: &str,
        migration: &dyn Migration,
    ) -> Result<Option<MigrationRecord>> {
        if Ledger::new(conn, &self.table)?.contains(version)? {
            debug!("migration {version} was recorded concurrently, skipping");
            return Ok(None);
        }

        debug!("migration {version} manages its own transaction");
        let started = Instant::now();
        migration.up(conn).map_err(|e| tag_failure(version, e))?;
        let record = MigrationRecord::completed(version, started.elapsed());

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(|e| {
                tag_failure(version, Error::Database(format!("failed to lock ledger: {e}")))
            })?;
        Ledger::new(&tx, &self.table)?.insert(&record)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit {version}: {e}")))?;
        Ok(Some(record))
    }

    fn execute_batch(
        &self,
        repository: &MigrationRepository<'_>,
        scan: &Scan,
        conn: &mut Connection,
        pending: &[String],
    ) -> Result<Vec<MigrationRecord>> {
        let mut batch = Vec::with_capacity(pending.len());

        for version in pending {
            let migration = repository
                .instantiate(scan, version)
                .map_err(|e| tag_failure(version, e))?;
            let started = Instant::now();
            migration
                .up(conn)
                .map_err(|e| tag_failure(version, e))?;
            batch.push(MigrationRecord::completed(version.as_str(), started.elapsed()));
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(|e| Error::Database(format!("failed to lock ledger: {e}")))?;
        let ledger = Ledger::new(&tx, &self.table)?;
        for record in &batch {
            ledger.insert(record)?;
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit migration batch: {e}")))?;

        for record in &batch {
            info!(
                "applied migration {} in {}ms",
                record.version,
                record.execution_time.unwrap_or_default()
            );
        }
        Ok(batch)
    }

    /// Scaffold a new migration pair in the configured directory.
    pub fn generate(
        &self,
        name: Option<&str>,
        up: Option<&str>,
        down: Option<&str>,
    ) -> Result<GeneratedMigration> {
        Generator::new(&self.config).generate(name, up, down)
    }
}

fn tag_failure(version: &str, err: Error) -> Error {
    match err {
        Error::Migration { .. } => err,
        other => Error::migration(version, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::SqlMigration;

    fn ledger_count(migrator: &Migrator) -> usize {
        migrator
            .with_connection(|conn| Ledger::new(conn, "rosua_migrations")?.count())
            .unwrap()
    }

    fn table_exists(migrator: &Migrator, name: &str) -> bool {
        migrator
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [name],
                    |row| row.get(0),
                )
                .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap()
    }

    fn total_changes(migrator: &Migrator) -> i64 {
        migrator
            .with_connection(|conn| {
                conn.query_row("SELECT total_changes()", [], |row| row.get(0))
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap()
    }

    fn registry_with(versions: &[(&str, &'static str)]) -> MigrationRegistry {
        let mut registry = MigrationRegistry::new();
        for (version, sql) in versions {
            let sql = *sql;
            registry
                .register_fn("RosuaMigrations", *version, move |conn: &Connection| {
                    conn.execute_batch(sql)
                        .map_err(|e| Error::Database(e.to_string()))
                })
                .unwrap();
        }
        registry
    }

    fn empty_dir_config() -> (tempfile::TempDir, MigrationConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let config = MigrationConfig::default().with_base_path(tmp.path());
        (tmp, config)
    }

    #[test]
    fn install_is_idempotent() {
        let (_tmp, config) = empty_dir_config();
        let migrator = Migrator::in_memory(config, MigrationRegistry::new()).unwrap();

        assert!(migrator.install().unwrap());
        assert!(!migrator.install().unwrap());
        assert!(!migrator.install().unwrap());
        assert!(table_exists(&migrator, "rosua_migrations"));
    }

    #[test]
    fn install_honours_table_prefix() {
        let (_tmp, config) = empty_dir_config();
        let migrator = Migrator::in_memory(
            config.with_table_prefix("wp_"),
            MigrationRegistry::new(),
        )
        .unwrap();

        migrator.install().unwrap();
        assert!(table_exists(&migrator, "wp_rosua_migrations"));
        assert!(!table_exists(&migrator, "rosua_migrations"));
    }

    #[test]
    fn invalid_table_name_is_a_config_error() {
        let (_tmp, config) = empty_dir_config();
        let result = Migrator::in_memory(
            config.with_table_name("bad name"),
            MigrationRegistry::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn execute_applies_pending_and_records_them() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[
            ("20230101000000", "CREATE TABLE users (id INTEGER PRIMARY KEY);"),
            ("20230102000000", "ALTER TABLE users ADD COLUMN email TEXT;"),
        ]);
        let migrator = Migrator::in_memory(config, registry).unwrap();
        migrator.install().unwrap();

        let executed = migrator.execute().unwrap();
        let versions: Vec<_> = executed.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["20230101000000", "20230102000000"]);
        assert!(executed.iter().all(|r| r.execution_time.unwrap() >= 0));
        assert!(executed[0].executed_at <= executed[1].executed_at);
        assert_eq!(ledger_count(&migrator), 2);

        assert!(migrator.list().unwrap().iter().all(|e| e.executed));
    }

    #[test]
    fn execute_with_nothing_pending_writes_nothing() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[("20230101000000", "CREATE TABLE a (x INTEGER);")]);
        let migrator = Migrator::in_memory(config, registry).unwrap();
        migrator.install().unwrap();
        migrator.execute().unwrap();

        let changes_before = total_changes(&migrator);
        assert!(migrator.execute().unwrap().is_empty());
        let changes_after = total_changes(&migrator);
        assert_eq!(changes_before, changes_after);
        assert_eq!(ledger_count(&migrator), 1);
    }

    #[test]
    fn execute_without_install_fails_before_running_anything() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[("20230101000000", "CREATE TABLE a (x INTEGER);")]);
        let migrator = Migrator::in_memory(config, registry).unwrap();

        let err = migrator.execute().unwrap_err();
        assert!(err.to_string().contains("run install first"));
        assert!(!table_exists(&migrator, "a"));
    }

    #[test]
    fn per_migration_failure_keeps_earlier_records() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[
            ("20230101000000", "CREATE TABLE a (x INTEGER);"),
            ("20230102000000", "CREATE TABLE b (x INTEGER); INSERT INTO missing VALUES (1);"),
            ("20230103000000", "CREATE TABLE c (x INTEGER);"),
        ]);
        let migrator = Migrator::in_memory(config, registry).unwrap();
        migrator.install().unwrap();

        let err = migrator.execute().unwrap_err();
        assert_eq!(err.failed_version(), Some("20230102000000"));

        assert!(table_exists(&migrator, "a"));
        assert!(!table_exists(&migrator, "b"), "failed migration is rolled back");
        assert!(!table_exists(&migrator, "c"), "later migrations never run");

        let statuses = migrator.list().unwrap();
        let executed: Vec<_> = statuses.iter().map(|e| e.executed).collect();
        assert_eq!(executed, vec![true, false, false]);
    }

    #[test]
    fn batch_failure_records_nothing() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[
            ("20230101000000", "CREATE TABLE a (x INTEGER);"),
            ("20230102000000", "INSERT INTO missing VALUES (1);"),
        ]);
        let migrator = Migrator::in_memory(config, registry)
            .unwrap()
            .with_recording_mode(RecordingMode::Batch);
        migrator.install().unwrap();

        let err = migrator.execute().unwrap_err();
        assert_eq!(err.failed_version(), Some("20230102000000"));

        // A ran but has no ledger row, so it is still reported pending.
        assert!(table_exists(&migrator, "a"));
        assert_eq!(ledger_count(&migrator), 0);
        assert!(migrator.list().unwrap().iter().all(|e| !e.executed));
    }

    #[test]
    fn batch_mode_records_every_version_on_success() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[
            ("20230101000000", "CREATE TABLE a (x INTEGER);"),
            ("20230102000000", "CREATE TABLE b (x INTEGER);"),
        ]);
        let migrator = Migrator::in_memory(config, registry)
            .unwrap()
            .with_recording_mode(RecordingMode::Batch);
        migrator.install().unwrap();

        assert_eq!(migrator.execute().unwrap().len(), 2);
        assert_eq!(ledger_count(&migrator), 2);
    }

    #[test]
    fn per_migration_skips_versions_recorded_elsewhere() {
        let (_tmp, config) = empty_dir_config();
        let registry = registry_with(&[("20230101000000", "CREATE TABLE a (x INTEGER);")]);
        let migrator = Migrator::in_memory(config, registry).unwrap();
        migrator.install().unwrap();

        // Recorded between the pending read and the locked write.
        let repository = migrator.repository();
        let scan = repository.scan().unwrap();
        let mut conn = migrator.connection().unwrap();
        Ledger::new(&conn, "rosua_migrations")
            .unwrap()
            .insert(&MigrationRecord::completed(
                "20230101000000",
                std::time::Duration::ZERO,
            ))
            .unwrap();

        let executed = migrator
            .execute_per_migration(
                &repository,
                &scan,
                &mut conn,
                &["20230101000000".to_string()],
            )
            .unwrap();
        assert!(executed.is_empty());
        drop(conn);
        assert!(!table_exists(&migrator, "a"));
    }

    fn write_sql(config: &MigrationConfig, name: &str, sql: &str) {
        let dir = config.migrations_path();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), sql).unwrap();
    }

    fn foreign_keys(migrator: &Migrator) -> i64 {
        migrator
            .with_connection(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap()
    }

    #[test]
    fn script_with_its_own_transaction_runs_in_default_mode() {
        let (_tmp, config) = empty_dir_config();
        write_sql(
            &config,
            "20230101000000.up.sql",
            "BEGIN;\nCREATE TABLE a (x INTEGER);\nCOMMIT;",
        );
        write_sql(&config, "20230102000000.up.sql", "CREATE TABLE b (x INTEGER);");
        let migrator = Migrator::in_memory(config, MigrationRegistry::new()).unwrap();
        migrator.install().unwrap();

        let executed = migrator.execute().unwrap();
        assert_eq!(executed.len(), 2);
        assert!(table_exists(&migrator, "a"));
        assert!(table_exists(&migrator, "b"));
        assert_eq!(ledger_count(&migrator), 2);
        assert!(migrator.execute().unwrap().is_empty());
    }

    #[test]
    fn foreign_keys_pragma_takes_effect_in_default_mode() {
        let (_tmp, config) = empty_dir_config();
        write_sql(
            &config,
            "20230101000000.up.sql",
            "PRAGMA foreign_keys=OFF;\nCREATE TABLE a (x INTEGER);",
        );
        let migrator = Migrator::in_memory(config, MigrationRegistry::new()).unwrap();
        migrator
            .with_connection(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=ON;")
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(foreign_keys(&migrator), 1);
        migrator.install().unwrap();

        assert_eq!(migrator.execute().unwrap().len(), 1);
        assert_eq!(foreign_keys(&migrator), 0);
        assert!(table_exists(&migrator, "a"));
        assert_eq!(ledger_count(&migrator), 1);
    }

    #[test]
    fn instantiate_failure_names_the_version() {
        let (_tmp, config) = empty_dir_config();
        let mut registry = MigrationRegistry::new();
        registry
            .register("RosuaMigrations", "20230105000000", || {
                SqlMigration::new("20230101000000", "SELECT 1;", None)
            })
            .unwrap();
        let migrator = Migrator::in_memory(config, registry).unwrap();
        migrator.install().unwrap();

        let err = migrator.execute().unwrap_err();
        assert_eq!(err.failed_version(), Some("20230105000000"));
        assert_eq!(ledger_count(&migrator), 0);
    }

    #[test]
    fn batch_reports_version_of_script_removed_after_scan() {
        let (_tmp, config) = empty_dir_config();
        write_sql(&config, "20230101000000.up.sql", "CREATE TABLE a (x INTEGER);");
        let migrator = Migrator::in_memory(config, MigrationRegistry::new())
            .unwrap()
            .with_recording_mode(RecordingMode::Batch);
        migrator.install().unwrap();

        let repository = migrator.repository();
        let scan = repository.scan().unwrap();
        std::fs::remove_file(
            migrator.config().migrations_path().join("20230101000000.up.sql"),
        )
        .unwrap();

        let mut conn = migrator.connection().unwrap();
        let err = migrator
            .execute_batch(
                &repository,
                &scan,
                &mut conn,
                &["20230101000000".to_string()],
            )
            .unwrap_err();
        assert_eq!(err.failed_version(), Some("20230101000000"));
    }

    #[test]
    fn namespace_selects_registered_migrations() {
        let (_tmp, config) = empty_dir_config();
        let mut registry = registry_with(&[("20230101000000", "CREATE TABLE a (x INTEGER);")]);
        registry
            .register_fn("Other", "20230102000000", |conn: &Connection| {
                conn.execute_batch("CREATE TABLE b (x INTEGER);")
                    .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap();
        let migrator = Migrator::in_memory(config.with_namespace("Other"), registry).unwrap();
        migrator.install().unwrap();

        let listed: Vec<_> = migrator
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(listed, vec!["20230102000000"]);

        migrator.execute().unwrap();
        assert!(table_exists(&migrator, "b"));
        assert!(!table_exists(&migrator, "a"));
    }

    #[test]
    fn generate_writes_into_configured_directory() {
        let (tmp, config) = empty_dir_config();
        let migrator = Migrator::in_memory(config, MigrationRegistry::new()).unwrap();

        let generated = migrator.generate(Some("init"), None, None).unwrap();
        assert!(generated.up_path.starts_with(tmp.path().join("migrations")));
        assert_eq!(migrator.scan().unwrap().len(), 1);
    }
}
