use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("database error: {0}")]
    Database(String),

    /// A migration body failed. Carries the version so callers can report
    /// exactly where a run stopped.
    #[error("migration {version} failed: {message}")]
    Migration { version: String, message: String },

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap any error raised while applying `version`.
    pub fn migration(version: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Migration {
            version: version.into(),
            message: err.to_string(),
        }
    }

    /// The version whose body failed, if this is a migration failure.
    pub fn failed_version(&self) -> Option<&str> {
        match self {
            Self::Migration { version, .. } => Some(version),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Database("lock failed".into());
        assert_eq!(e.to_string(), "database error: lock failed");

        let e = Error::InvalidMigration("duplicate version".into());
        assert_eq!(e.to_string(), "invalid migration: duplicate version");

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn migration_error_names_failing_version() {
        let e = Error::migration("20230102000000", "no such table: users");
        assert_eq!(
            e.to_string(),
            "migration 20230102000000 failed: no such table: users"
        );
        assert_eq!(e.failed_version(), Some("20230102000000"));
        assert_eq!(Error::Other("x".into()).failed_version(), None);
    }
}
