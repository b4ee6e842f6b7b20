//! Client configuration: TOML file, `MCP_PROBE_*` environment variables and
//! `.env` files. Command-line flags are layered on top by the CLI.

pub mod data;
pub mod env;
pub mod io;


pub use data::{path_display, ClientConfig, LogConfig};
pub use io::ConfigError;
