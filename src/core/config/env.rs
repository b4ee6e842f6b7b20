//! Environment inputs: `MCP_PROBE_*` overrides for the client configuration
//! and `.env` files destined for the server subprocess.

use super::data::ClientConfig;
use super::io::ConfigError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "MCP_PROBE_";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Reads `MCP_PROBE_*` variables through `lookup` and returns them as a
/// config layer.
pub fn env_overrides(lookup: impl Fn(&str) -> Option<String>) -> Result<ClientConfig, ConfigError> {
    let var = |suffix: &str| {
        lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|value| !value.trim().is_empty())
    };

    let mut config = ClientConfig {
        client_name: var("CLIENT_NAME"),
        client_version: var("CLIENT_VERSION"),
        protocol_version: var("PROTOCOL_VERSION"),
        request_timeout_secs: parse_var(&var, "REQUEST_TIMEOUT_SECS")?,
        handshake_timeout_secs: parse_var(&var, "HANDSHAKE_TIMEOUT_SECS")?,
        max_list_pages: parse_var(&var, "MAX_LIST_PAGES")?,
        endpoint: None,
        log: Default::default(),
    };
    config.log.level = var("LOG_LEVEL");
    config.log.log_file = var("LOG_FILE").map(PathBuf::from);
    config.log.log_requests = parse_flag(&var, "LOG_REQUESTS")?;
    config.log.log_responses = parse_flag(&var, "LOG_RESPONSES")?;
    Ok(config)
}

pub fn process_env_overrides() -> Result<ClientConfig, ConfigError> {
    env_overrides(|key| std::env::var(key).ok())
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(suffix)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|err| {
                ConfigError::invalid(format!("{ENV_PREFIX}{suffix}"), err.to_string())
            })
        })
        .transpose()
}

fn parse_flag(
    var: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<bool>, ConfigError> {
    var(suffix)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::invalid(
                format!("{ENV_PREFIX}{suffix}"),
                format!("expected a boolean, got {other:?}"),
            )),
        })
        .transpose()
}

/// Parses a `.env` file without touching the process environment.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let to_error = |source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    let mut vars = BTreeMap::new();
    // `dotenv::Iter` is not exported; `from_path_iter` is the public
    // equivalent of `Iter::new(File::open(path)?)`.
    #[allow(deprecated)]
    let entries = dotenv::from_path_iter(path).map_err(to_error)?;
    for entry in entries {
        let (key, value) = entry.map_err(to_error)?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Loads the explicit env file, or `./.env` when present.
pub fn resolve_env_file(explicit: Option<&Path>) -> Result<BTreeMap<String, String>, ConfigError> {
    match explicit {
        Some(path) => load_env_file(path),
        None => {
            let fallback = Path::new(DEFAULT_ENV_FILE);
            if fallback.is_file() {
                load_env_file(fallback)
            } else {
                Ok(BTreeMap::new())
            }
        }
    }
}
