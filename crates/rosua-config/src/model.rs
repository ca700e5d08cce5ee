use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_TABLE_NAME: &str = "rosua_migrations";
pub const DEFAULT_NAMESPACE: &str = "RosuaMigrations";
pub const DEFAULT_DIRECTORY: &str = "migrations";

/// Top-level configuration file read by the `rosua` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database the ledger and the migrations live in.
    pub database: Option<PathBuf>,
    pub migrations: MigrationConfig,
}

/// Settings of one migration set. Immutable once built: there are no
/// setters, only the consuming `with_*` chain used while constructing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    #[serde(alias = "tableName")]
    table_name: String,
    #[serde(alias = "tablePrefix", alias = "prefix")]
    table_prefix: String,
    namespace: String,
    directory: PathBuf,
    #[serde(alias = "basePath")]
    base_path: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            table_prefix: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            base_path: PathBuf::from("."),
        }
    }
}

impl MigrationConfig {
    /// Build from a flat key/value map. Unknown keys are ignored and missing
    /// ones keep their defaults. Both `table_name` and `tableName` spellings
    /// are understood; the snake_case key wins when both are present.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            table_name: first_present(map, &["table_name", "tableName"])
                .unwrap_or(defaults.table_name),
            table_prefix: first_present(map, &["table_prefix", "tablePrefix", "prefix"])
                .unwrap_or(defaults.table_prefix),
            namespace: first_present(map, &["namespace"]).unwrap_or(defaults.namespace),
            directory: first_present(map, &["directory"])
                .map(PathBuf::from)
                .unwrap_or(defaults.directory),
            base_path: first_present(map, &["base_path", "basePath"])
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    /// Physical name of the ledger table: prefix followed by table name.
    pub fn ledger_table(&self) -> String {
        format!("{}{}", self.table_prefix, self.table_name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding the migration definitions. An absolute `directory`
    /// wins over `base_path`.
    pub fn migrations_path(&self) -> PathBuf {
        self.base_path.join(&self.directory)
    }
}

/// Value of the first key in `keys` that `map` contains.
fn first_present(map: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key)).cloned()
}
