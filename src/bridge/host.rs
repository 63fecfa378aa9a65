//! Host resolution from layered `ssh_config` sources.
//!
//! A host identifier sent by a caller is turned into concrete connection
//! parameters ([`HostDetails`]) by searching:
//!
//! 1. the user-level config (`~/.ssh/config`)
//! 2. the system-level config (`/etc/ssh/ssh_config`)
//!
//! How the sources are searched depends on the [`ResolvePolicy`]. When nothing
//! matches, a default is synthesized from the local login name, port 22 and
//! `~/.ssh/id_rsa`.
//!
//! Sources that cannot be read or parsed are skipped with a warning. Nothing is
//! cached: every call reads the files again.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use super::error::ExecError;
use super::ssh_config::{self, ConfigEntry};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Key used when no config entry names one, relative to the home directory
pub const DEFAULT_IDENTITY_FILE: &str = "~/.ssh/id_rsa";

/// System-wide client configuration
pub const SYSTEM_SSH_CONFIG: &str = "/etc/ssh/ssh_config";

/// Concrete connection parameters for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDetails {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Always absolute.
    pub identity_file: PathBuf,
}

impl HostDetails {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// How the configuration sources are searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvePolicy {
    /// Scan user then system config; the first exact match wins.
    #[default]
    FirstMatch,
    /// Scan only the user config; prefer an exact match, then `Host *`.
    ExactThenWildcard,
}

impl FromStr for ResolvePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-match" | "first_match" => Ok(ResolvePolicy::FirstMatch),
            "exact-then-wildcard" | "exact_then_wildcard" => {
                Ok(ResolvePolicy::ExactThenWildcard)
            }
            other => Err(format!("unknown resolve policy '{}'", other)),
        }
    }
}

impl fmt::Display for ResolvePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvePolicy::FirstMatch => f.write_str("first-match"),
            ResolvePolicy::ExactThenWildcard => f.write_str("exact-then-wildcard"),
        }
    }
}

/// The local account the bridge runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Login name, used as the remote user when none is configured
    pub user: String,
    pub home: PathBuf,
}

impl LocalIdentity {
    /// Look up the current OS user. `None` if either part is unavailable.
    pub fn current() -> Option<Self> {
        let user = whoami::fallible::username().ok()?;
        let home = dirs::home_dir()?;
        Some(Self { user, home })
    }
}

/// Resolves host identifiers to [`HostDetails`].
#[derive(Debug, Clone)]
pub struct HostResolver {
    user_config: Option<PathBuf>,
    system_config: Option<PathBuf>,
    policy: ResolvePolicy,
    identity: Option<LocalIdentity>,
}

impl HostResolver {
    pub fn new(
        user_config: Option<PathBuf>,
        system_config: Option<PathBuf>,
        policy: ResolvePolicy,
        identity: Option<LocalIdentity>,
    ) -> Self {
        Self {
            user_config,
            system_config,
            policy,
            identity,
        }
    }

    /// Resolver over the conventional config locations of the current user.
    pub fn from_env(policy: ResolvePolicy) -> Self {
        let identity = LocalIdentity::current();
        let user_config = identity
            .as_ref()
            .map(|id| id.home.join(".ssh").join("config"));

        Self::new(
            user_config,
            Some(PathBuf::from(SYSTEM_SSH_CONFIG)),
            policy,
            identity,
        )
    }

    /// Resolve `host` into connection parameters.
    pub async fn resolve(&self, host: &str) -> Result<HostDetails, ExecError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(self.unresolvable(host, "empty host identifier"));
        }

        let matched = match self.policy {
            ResolvePolicy::FirstMatch => self.first_match(host).await,
            ResolvePolicy::ExactThenWildcard => self.exact_then_wildcard(host).await,
        };

        match matched {
            Some((entry, source)) => {
                debug!(
                    "Host '{}' matched {:?} in {}",
                    host,
                    entry.patterns,
                    source.display()
                );
                self.details_from_entry(host, &entry)
            }
            None => {
                debug!("No ssh_config entry for '{}', using defaults", host);
                self.details_from_entry(host, &ConfigEntry::default())
            }
        }
    }

    async fn first_match(&self, host: &str) -> Option<(ConfigEntry, PathBuf)> {
        for path in [&self.user_config, &self.system_config].into_iter().flatten() {
            let Some(entries) = load_source(path).await else {
                continue;
            };
            if let Some(entry) = entries.into_iter().find(|e| e.matches_exactly(host)) {
                return Some((entry, path.clone()));
            }
        }
        None
    }

    async fn exact_then_wildcard(&self, host: &str) -> Option<(ConfigEntry, PathBuf)> {
        let path = self.user_config.as_ref()?;
        let entries = load_source(path).await?;

        let exact = entries.iter().position(|e| e.matches_exactly(host));
        let chosen = exact.or_else(|| entries.iter().position(ConfigEntry::is_wildcard))?;

        entries
            .into_iter()
            .nth(chosen)
            .map(|entry| (entry, path.clone()))
    }

    /// Fill the gaps of `entry` with the synthesized defaults.
    fn details_from_entry(
        &self,
        host: &str,
        entry: &ConfigEntry,
    ) -> Result<HostDetails, ExecError> {
        let user = match (&entry.user, &self.identity) {
            (Some(user), _) => user.clone(),
            (None, Some(identity)) => identity.user.clone(),
            (None, None) => return Err(self.unresolvable(host, "failed to get current user")),
        };

        let raw_identity = entry
            .identity_file
            .as_deref()
            .unwrap_or(DEFAULT_IDENTITY_FILE);
        let home = self.identity.as_ref().map(|id| id.home.as_path());
        let identity_file =
            expand_identity_path(raw_identity, home).map_err(|e| self.unresolvable(host, &e))?;

        Ok(HostDetails {
            host: entry.host_name.clone().unwrap_or_else(|| host.to_string()),
            user,
            port: entry.port.unwrap_or(DEFAULT_SSH_PORT),
            identity_file,
        })
    }

    fn unresolvable(&self, host: &str, reason: &str) -> ExecError {
        ExecError::HostNotResolvable {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Read and parse one config source. Failures are logged and skipped.
async fn load_source(path: &Path) -> Option<Vec<ConfigEntry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("ssh_config {} not found, skipping", path.display());
            return None;
        }
        Err(e) => {
            warn!("Failed to read ssh_config {}: {}", path.display(), e);
            return None;
        }
    };

    match ssh_config::parse(&content) {
        Ok(entries) => Some(entries),
        Err(e) => {
            warn!("Skipping unparseable ssh_config {}: {}", path.display(), e);
            None
        }
    }
}

/// Expand `~`, `~/...` and relative paths against `home`.
pub(crate) fn expand_identity_path(raw: &str, home: Option<&Path>) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let home = home.ok_or_else(|| "failed to get home directory".to_string())?;

    if raw == "~" {
        return Ok(home.to_path_buf());
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return Ok(home.join(rest));
    }
    if raw.starts_with('~') {
        return Err(format!("cannot expand user-specific path '{}'", raw));
    }

    Ok(home.join(path))
}
