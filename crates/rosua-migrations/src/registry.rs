use std::collections::BTreeMap;
use std::sync::Arc;

use rosua_common::{Error, Result};
use rusqlite::Connection;

use crate::migration::{Migration, validate_version};

/// Builds a fresh migration instance for one run.
pub type MigrationFactory = Box<dyn Fn() -> Box<dyn Migration> + Send + Sync>;

type UpFn = dyn Fn(&Connection) -> Result<()> + Send + Sync;

/// Explicit table of Rust-defined migrations, keyed by namespace and then
/// by version.
#[derive(Default)]
pub struct MigrationRegistry {
    namespaces: BTreeMap<String, BTreeMap<String, MigrationFactory>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `version` under `namespace`.
    pub fn register<F, M>(
        &mut self,
        namespace: impl Into<String>,
        version: impl Into<String>,
        factory: F,
    ) -> Result<()>
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Migration + 'static,
    {
        let namespace = namespace.into();
        let version = version.into();
        validate_version(&version)?;

        let versions = self.namespaces.entry(namespace.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(Error::InvalidMigration(format!(
                "version {version} is already registered in {namespace}"
            )));
        }
        versions.insert(
            version,
            Box::new(move || Box::new(factory()) as Box<dyn Migration>),
        );
        Ok(())
    }

    /// Register a migration value; each run gets its own clone.
    pub fn add<M>(&mut self, namespace: impl Into<String>, migration: M) -> Result<()>
    where
        M: Migration + Clone + Send + Sync + 'static,
    {
        let version = migration.version().to_string();
        self.register(namespace, version, move || migration.clone())
    }

    /// Register a closure as the `up` body of `version`.
    pub fn register_fn<F>(
        &mut self,
        namespace: impl Into<String>,
        version: impl Into<String>,
        up: F,
    ) -> Result<()>
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        let version = version.into();
        let up: Arc<UpFn> = Arc::new(up);
        let key = version.clone();
        self.register(namespace, key, move || FnMigration {
            version: version.clone(),
            up: Arc::clone(&up),
        })
    }

    /// Versions registered under `namespace`, ascending.
    pub fn versions<'a>(&'a self, namespace: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.namespaces
            .get(namespace)
            .into_iter()
            .flat_map(|versions| versions.keys().map(String::as_str))
    }

    /// Build the migration for `version`, checking the instance reports the
    /// version it was registered under.
    pub fn instantiate(&self, namespace: &str, version: &str) -> Result<Box<dyn Migration>> {
        let factory = self
            .namespaces
            .get(namespace)
            .and_then(|versions| versions.get(version))
            .ok_or_else(|| {
                Error::NotFound(format!("migration {version} is not registered in {namespace}"))
            })?;

        let migration = factory();
        if migration.version() != version {
            return Err(Error::InvalidMigration(format!(
                "migration registered as {version} reports version {}",
                migration.version()
            )));
        }
        Ok(migration)
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FnMigration {
    version: String,
    up: Arc<UpFn>,
}

impl Migration for FnMigration {
    fn version(&self) -> &str {
        &self.version
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        (self.up)(conn)
    }
}
