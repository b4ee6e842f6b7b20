//! mcp-probe is a protocol test harness for the Model Context Protocol.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the session runtime: endpoint descriptors, transports, the
//!   JSON-RPC codec, request correlation, the session state machine, callback
//!   dispatch for server-initiated requests, and the protocol log.
//! - [`core`] loads and layers client configuration.
//! - [`cli`] parses arguments, runs one command against a session and maps
//!   the outcome to an exit code.
//! - [`utils`] holds process-wide helpers such as tracing setup.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
