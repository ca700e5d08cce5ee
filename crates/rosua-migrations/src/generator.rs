use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rosua_common::{Error, Result};
use rosua_config::MigrationConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::migration::{MAX_VERSION_LEN, validate_version};

/// Width of the numeric version prefix: `YYYYMMDDHHMMSS` plus milliseconds.
const STAMP_DIGITS: usize = 17;

/// Paths of a freshly scaffolded migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedMigration {
    pub version: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Scaffolds `<version>.up.sql` / `<version>.down.sql` stub pairs.
pub struct Generator<'a> {
    config: &'a MigrationConfig,
    last_stamp: Option<u64>,
}

impl<'a> Generator<'a> {
    pub fn new(config: &'a MigrationConfig) -> Self {
        Self {
            config,
            last_stamp: None,
        }
    }

    /// Write a new stub pair. `name` becomes a readable suffix of the version;
    /// `up` and `down` prefill the scripts.
    pub fn generate(
        &mut self,
        name: Option<&str>,
        up: Option<&str>,
        down: Option<&str>,
    ) -> Result<GeneratedMigration> {
        let dir = self.config.migrations_path();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Filesystem(format!("failed to create {}: {e}", dir.display())))?;

        let stamp = self.next_stamp(&dir)?;
        let mut version = format!("{stamp:0width$}", width = STAMP_DIGITS);
        let slug = name.map(slugify).unwrap_or_default();
        if !slug.is_empty() {
            let room = MAX_VERSION_LEN - version.len() - 1;
            version.push('_');
            version.push_str(slug.get(..room).unwrap_or(&slug));
        }
        validate_version(&version)?;

        let up_path = dir.join(format!("{version}.up.sql"));
        let down_path = dir.join(format!("{version}.down.sql"));
        write_pair(
            (&up_path, &self.stub_header(&version, "up"), up),
            (&down_path, &self.stub_header(&version, "down"), down),
        )?;

        info!("generated migration {version} in {}", dir.display());
        self.last_stamp = Some(stamp);
        Ok(GeneratedMigration {
            version,
            up_path,
            down_path,
        })
    }

    /// Current time as a stamp, bumped past anything already issued or
    /// present on disk so the new version sorts last.
    fn next_stamp(&self, dir: &Path) -> Result<u64> {
        let now: u64 = Utc::now()
            .format("%Y%m%d%H%M%S%3f")
            .to_string()
            .parse()
            .map_err(|e| Error::Other(format!("failed to build version stamp: {e}")))?;

        let floor = existing_floor(dir)?.max(self.last_stamp);
        Ok(match floor {
            Some(floor) if now <= floor => floor + 1,
            _ => now,
        })
    }

    fn stub_header(&self, version: &str, direction: &str) -> String {
        format!("-- {} {version} ({direction})\n", self.config.namespace())
    }
}

/// Largest stamp a new version has to exceed. Digit prefixes shorter than
/// [`STAMP_DIGITS`] are padded with nines: anything that starts with them
/// and is longer would otherwise still sort after the new version.
fn existing_floor(dir: &Path) -> Result<Option<u64>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Filesystem(format!("failed to read {}: {e}", dir.display())))?;

    let mut floor = None;
    for entry in entries {
        let entry = entry
            .map_err(|e| Error::Filesystem(format!("failed to read {}: {e}", dir.display())))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !(name.ends_with(".up.sql") || name.ends_with(".down.sql")) {
            continue;
        }

        let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            continue;
        }
        let mut padded: String = digits.chars().take(STAMP_DIGITS).collect();
        while padded.len() < STAMP_DIGITS {
            padded.push('9');
        }
        if let Ok(stamp) = padded.parse::<u64>() {
            floor = floor.max(Some(stamp));
        }
    }
    Ok(floor)
}

type Stub<'s> = (&'s Path, &'s str, Option<&'s str>);

/// Both stubs or neither: a failed down write removes the up file again.
fn write_pair(up: Stub<'_>, down: Stub<'_>) -> Result<()> {
    write_stub(up.0, up.1, up.2)?;
    if let Err(err) = write_stub(down.0, down.1, down.2) {
        if let Err(e) = std::fs::remove_file(up.0) {
            warn!("failed to remove {}: {e}", up.0.display());
        }
        return Err(err);
    }
    Ok(())
}

fn write_stub(path: &Path, header: &str, body: Option<&str>) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::Filesystem(format!("failed to create {}: {e}", path.display())))?;

    let body = body.unwrap_or("-- Write the SQL for this step here.");
    file.write_all(format!("{header}{body}\n").as_bytes())
        .map_err(|e| Error::Filesystem(format!("failed to write {}: {e}", path.display())))
}

/// Lowercase ASCII alphanumerics; every other run becomes one `_`.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}
