use crate::mcp::client::{
    SessionOptions, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_MAX_LIST_PAGES,
    DEFAULT_REQUEST_TIMEOUT_SECS, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::endpoint::EndpointDescriptor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::io::ConfigError;

pub const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. "info" or "mcp_probe=debug".
    pub level: Option<String>,
    /// Write tracing output here instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Mirror sent frames into tracing at debug level.
    pub log_requests: Option<bool>,
    /// Mirror received frames into tracing at debug level.
    pub log_responses: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ClientConfig {
    /// Name sent as `clientInfo.name` during the handshake.
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    /// Protocol version offered in `initialize`.
    pub protocol_version: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    /// Upper bound on pages fetched by a single list operation.
    pub max_list_pages: Option<usize>,
    /// Server to talk to when no connection flag is given.
    pub endpoint: Option<EndpointDescriptor>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Get a user-friendly display string for a path, using `~` for the home
/// directory on Unix-like systems.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl ClientConfig {
    /// Overlays every value set in `other` onto `self`.
    pub fn merge(&mut self, other: ClientConfig) {
        macro_rules! take {
            ($($field:ident).+) => {
                if other.$($field).+.is_some() {
                    self.$($field).+ = other.$($field).+;
                }
            };
        }
        take!(client_name);
        take!(client_version);
        take!(protocol_version);
        take!(request_timeout_secs);
        take!(handshake_timeout_secs);
        take!(max_list_pages);
        take!(endpoint);
        take!(log.level);
        take!(log.log_file);
        take!(log.log_requests);
        take!(log.log_responses);
    }

    pub fn log_level(&self) -> &str {
        self.log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Checks values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::invalid(field, "must be at least 1 second"));
            }
        }
        if self.max_list_pages == Some(0) {
            return Err(ConfigError::invalid("max_list_pages", "must be at least 1"));
        }
        if let Some(version) = &self.protocol_version {
            if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) {
                return Err(ConfigError::invalid(
                    "protocol_version",
                    format!(
                        "{version} is not one of {}",
                        SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                    ),
                ));
            }
        }
        for (field, value) in [
            ("client_name", &self.client_name),
            ("client_version", &self.client_version),
        ] {
            if value.as_deref().is_some_and(|text| text.trim().is_empty()) {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }
        if let Some(endpoint) = &self.endpoint {
            endpoint
                .validate()
                .map_err(|err| ConfigError::invalid("endpoint", err.to_string()))?;
        }
        Ok(())
    }

    /// Session tunables with defaults filled in.
    pub fn session_options(&self) -> SessionOptions {
        let defaults = SessionOptions::default();
        SessionOptions {
            client_name: self.client_name.clone().unwrap_or(defaults.client_name),
            client_version: self
                .client_version
                .clone()
                .unwrap_or(defaults.client_version),
            protocol_version: self
                .protocol_version
                .clone()
                .unwrap_or(defaults.protocol_version),
            request_timeout: Duration::from_secs(
                self.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            handshake_timeout: Duration::from_secs(
                self.handshake_timeout_secs
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ),
            max_list_pages: self.max_list_pages.unwrap_or(DEFAULT_MAX_LIST_PAGES),
            log_requests: self.log.log_requests.unwrap_or(false),
            log_responses: self.log.log_responses.unwrap_or(false),
            ..defaults
        }
    }
}
