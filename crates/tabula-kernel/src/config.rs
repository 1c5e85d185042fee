//! Runtime configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/tabula/tabula.ron` when present, then
//! overridden by environment variables:
//!
//! | Variable                | Field            |
//! |-------------------------|------------------|
//! | `TABULA_DOCUMENT`       | `document_path`  |
//! | `TABULA_DATABASE`       | `database_path`  |
//! | `TABULA_SHEET`          | `sheet`          |
//! | `TABULA_MAX_READ_CELLS` | `max_read_cells` |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use tabula_types::DEFAULT_MAX_CELLS;

pub const DEFAULT_SHEET: &str = "Sheet1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    /// The workbook file.
    pub document_path: PathBuf,
    /// SQLite file holding the confirmation ledger and conversation turns.
    pub database_path: PathBuf,
    /// The only sheet this workbook exposes.
    pub sheet: String,
    /// Largest range a single read may cover.
    pub max_read_cells: u64,
}

impl Default for TabulaConfig {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            document_path: data.join("tabula.json"),
            database_path: data.join("tabula.db"),
            sheet: DEFAULT_SHEET.to_string(),
            max_read_cells: DEFAULT_MAX_CELLS,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabula")
}

impl TabulaConfig {
    /// `$XDG_CONFIG_HOME/tabula/tabula.ron`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tabula").join("tabula.ron"))
    }

    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_ron(&text)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Resolve the effective config.
    ///
    /// An explicit path must exist. Without one, the default path is used if
    /// present, otherwise built-in defaults. Environment overrides apply last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        base.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `TABULA_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TABULA_DOCUMENT") {
            self.document_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("TABULA_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(sheet) = lookup("TABULA_SHEET") {
            self.sheet = sheet;
        }
        if let Some(raw) = lookup("TABULA_MAX_READ_CELLS") {
            self.max_read_cells = match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(value = %raw, "rejecting TABULA_MAX_READ_CELLS");
                    return Err(ConfigError::InvalidEnv {
                        var: "TABULA_MAX_READ_CELLS",
                        value: raw,
                    });
                }
            };
        }
        Ok(self)
    }

    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}
