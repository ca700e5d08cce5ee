//! Versioned database migrations for SQLite.
//!
//! Migration definitions come from two places: `<version>.up.sql` /
//! `<version>.down.sql` files under the configured directory, and Rust
//! migrations registered in a [`MigrationRegistry`]. The [`Migrator`] keeps a
//! ledger table of applied versions and runs pending ones in ascending
//! version order.

pub mod generator;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod registry;
pub mod repository;

pub use generator::{GeneratedMigration, Generator};
pub use ledger::{Ledger, MigrationRecord};
pub use migration::{
    MAX_VERSION_LEN, Migration, SqlMigration, controls_connection, validate_version,
};
pub use migrator::{Migrator, RecordingMode};
pub use registry::MigrationRegistry;
pub use repository::{
    MigrationListing, MigrationRepository, MigrationStatusEntry, RejectedMigration, Scan,
};
