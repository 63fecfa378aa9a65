//! HTTP to SSH command execution bridge.
//!
//! This module is organized into the following submodules:
//!
//! - `ssh_config`: Parser for the subset of `ssh_config` the bridge understands
//! - `host`: Host resolution across user and system `ssh_config` files
//! - `credential`: Private key loading and public key authentication
//! - `session`: SSH connection, host key policy and pty allocation
//! - `exec`: Command execution and the `Executor` entry point
//! - `relay`: Chunked, flushed copy from the executor to the caller
//! - `server`: `POST /ssh` endpoint
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and classification

pub mod config;
pub mod credential;
pub mod error;
pub mod exec;
pub mod host;
pub mod relay;
pub mod server;
pub mod session;
pub mod ssh_config;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use error::{ErrorKind, ExecError};
pub use exec::Executor;
pub use host::{HostDetails, HostResolver, ResolvePolicy};
pub use server::{OutputMode, routes};
pub use session::{HostKeyPolicy, RusshSessionFactory};
