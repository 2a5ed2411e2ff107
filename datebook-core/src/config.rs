//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Weekday;
use config::{Config, File};
use serde::Deserialize;

use crate::error::{StoreError, StoreResult};
use crate::window::parse_weekday;

static DEFAULT_CONNECT_TIMEOUT: &str = "30s";

/// Configuration at ~/.config/datebook/config.toml
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub week_starts_on: Weekday,
    /// Passed to the backend on every connect attempt
    pub connect_timeout: Duration,
    /// Where the last viewed month is remembered
    pub state_file: PathBuf,
}

/// On-disk shape; every key is optional.
#[derive(Deserialize, Default)]
struct RawConfig {
    week_starts_on: Option<String>,
    connect_timeout: Option<String>,
    state_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            week_starts_on: Weekday::Mon,
            connect_timeout: Duration::from_secs(30),
            state_file: default_state_file(),
        }
    }
}

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("datebook")
        .join("state.toml")
}

impl StoreConfig {
    pub fn config_path() -> StoreResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| StoreError::Config("Could not determine config directory".into()))?
            .join("datebook");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from the default location, creating a commented config file if missing.
    pub fn load() -> StoreResult<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            Self::create_default_config(&path)?;
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> StoreResult<Self> {
        let raw: RawConfig = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> StoreResult<Self> {
        let defaults = StoreConfig::default();

        let week_starts_on = match raw.week_starts_on {
            Some(name) => parse_weekday(&name).map_err(StoreError::Config)?,
            None => defaults.week_starts_on,
        };

        let connect_timeout = match raw.connect_timeout {
            Some(s) => humantime::parse_duration(&s)
                .map_err(|e| StoreError::Config(format!("Invalid connect_timeout '{s}': {e}")))?,
            None => defaults.connect_timeout,
        };

        let state_file = match raw.state_file {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()),
            None => defaults.state_file,
        };

        Ok(StoreConfig {
            week_starts_on,
            connect_timeout,
            state_file,
        })
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> StoreResult<()> {
        let contents = format!(
            "\
# datebook configuration

# First day of the week in month views:
# week_starts_on = \"monday\"

# How long to wait for a calendar source to connect:
# connect_timeout = \"{}\"

# Where the last viewed month is remembered:
# state_file = \"~/.local/share/datebook/state.toml\"
",
            DEFAULT_CONNECT_TIMEOUT
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| StoreError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}
