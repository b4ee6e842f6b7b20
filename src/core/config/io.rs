use crate::core::config::data::{path_display, ClientConfig};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while assembling the client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(path))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`ClientConfig`].
    #[error("Failed to parse config at {}: {source}", path_display(path))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to read env file {}: {source}", path_display(path))]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ClientConfig {
    /// Loads `config_path`, or the default configuration when it does not exist.
    pub fn load_from_path(config_path: &Path) -> Result<ClientConfig, ConfigError> {
        if !config_path.exists() {
            return Ok(ClientConfig::default());
        }
        Self::read(config_path)
    }

    fn read(config_path: &Path) -> Result<ClientConfig, ConfigError> {
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// An explicitly requested file must exist; the default location is
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<ClientConfig, ConfigError> {
        match explicit {
            Some(path) => Self::read(path),
            None => match Self::default_config_path() {
                Some(path) => Self::load_from_path(&path),
                None => Ok(ClientConfig::default()),
            },
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "mcp-probe", "mcp-probe")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
