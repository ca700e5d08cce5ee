use std::path::{Path, PathBuf};

use rosua_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// File names probed in the working directory when no config path is given.
const DEFAULT_CONFIG_FILES: [&str; 3] = ["rosua.yml", "rosua.yaml", "rosua.toml"];

pub struct ConfigLoader;

impl ConfigLoader {
    /// Read a YAML or TOML config file, chosen by extension.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Load `path` when given, otherwise the first default file present in
    /// `dir`, otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>, dir: &Path) -> Result<AppConfig> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::find_default(dir) {
            Some(found) => Self::load(&found),
            None => {
                debug!("no config file found in {}, using defaults", dir.display());
                Ok(AppConfig::default())
            }
        }
    }

    fn find_default(dir: &Path) -> Option<PathBuf> {
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}
