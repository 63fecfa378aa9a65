//! Configuration resolution for the SSH bridge.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! Environment values that do not parse are ignored and the default is used.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HSSH_ADDR` | `0.0.0.0:8080` | HTTP listen address |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 180s | Command execution timeout in seconds |
//! | `SSH_HOST_KEY_POLICY` | `strict` | Host key verification policy |
//! | `SSH_KNOWN_HOSTS` | `~/.ssh/known_hosts` | known_hosts file |
//! | `HSSH_RESOLVE_POLICY` | `first-match` | ssh_config search policy |
//! | `HSSH_OUTPUT_MODE` | `stream` | HTTP response mode |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use super::host::ResolvePolicy;
use super::server::OutputMode;
use super::session::HostKeyPolicy;

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default SSH connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default SSH command execution timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Environment variable name for the HTTP listen address
pub const LISTEN_ADDR_ENV_VAR: &str = "HSSH_ADDR";

/// Environment variable name for SSH connection timeout
pub const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for SSH command execution timeout
pub const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";

/// Environment variable name for the host key policy
pub const HOST_KEY_POLICY_ENV_VAR: &str = "SSH_HOST_KEY_POLICY";

/// Environment variable name for the known_hosts override
pub const KNOWN_HOSTS_ENV_VAR: &str = "SSH_KNOWN_HOSTS";

/// Environment variable name for the ssh_config resolve policy
pub const RESOLVE_POLICY_ENV_VAR: &str = "HSSH_RESOLVE_POLICY";

/// Environment variable name for the HTTP output mode
pub const OUTPUT_MODE_ENV_VAR: &str = "HSSH_OUTPUT_MODE";

/// Parse an environment variable, logging and ignoring bad values.
fn env_value<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring invalid {}='{}': {}", name, raw, e);
            None
        }
    }
}

/// Resolve the listen address with priority: parameter -> env var -> default
pub fn resolve_listen_addr(addr_param: Option<String>) -> String {
    // Priority 1: Use parameter if provided
    if let Some(addr) = addr_param {
        return addr;
    }

    // Priority 2: Use environment variable if set
    if let Ok(addr) = env::var(LISTEN_ADDR_ENV_VAR)
        && !addr.trim().is_empty()
    {
        return addr;
    }

    // Priority 3: Default value
    DEFAULT_LISTEN_ADDR.to_string()
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_value(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the command execution timeout with priority: parameter -> env var -> default
pub fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_value(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the host key policy with priority: parameter -> env var -> default (strict)
pub fn resolve_host_key_policy(policy_param: Option<HostKeyPolicy>) -> HostKeyPolicy {
    policy_param
        .or_else(|| env_value(HOST_KEY_POLICY_ENV_VAR))
        .unwrap_or_default()
}

/// Resolve the known_hosts override. `None` means the user's default file.
pub fn resolve_known_hosts(path_param: Option<PathBuf>) -> Option<PathBuf> {
    path_param.or_else(|| {
        env::var_os(KNOWN_HOSTS_ENV_VAR)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    })
}

/// Resolve the ssh_config policy with priority: parameter -> env var -> default (first-match)
pub fn resolve_resolve_policy(policy_param: Option<ResolvePolicy>) -> ResolvePolicy {
    policy_param
        .or_else(|| env_value(RESOLVE_POLICY_ENV_VAR))
        .unwrap_or_default()
}

/// Resolve the output mode with priority: parameter -> env var -> default (stream)
pub fn resolve_output_mode(mode_param: Option<OutputMode>) -> OutputMode {
    mode_param
        .or_else(|| env_value(OUTPUT_MODE_ENV_VAR))
        .unwrap_or_default()
}

/// Everything the binaries need, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: Option<PathBuf>,
    pub resolve_policy: ResolvePolicy,
    pub output_mode: OutputMode,
}

impl Settings {
    /// Resolve every value from the environment, with an optional listen address override.
    pub fn resolve(listen_addr_param: Option<String>) -> Self {
        Self {
            listen_addr: resolve_listen_addr(listen_addr_param),
            connect_timeout: resolve_connect_timeout(None),
            command_timeout: resolve_command_timeout(None),
            host_key_policy: resolve_host_key_policy(None),
            known_hosts: resolve_known_hosts(None),
            resolve_policy: resolve_resolve_policy(None),
            output_mode: resolve_output_mode(None),
        }
    }
}
