//! Minimal `ssh_config` reader.
//!
//! Only the directives the bridge needs are kept: `Host`, `HostName`, `User`,
//! `Port` and `IdentityFile`. Everything else is skipped. Keywords are
//! case-insensitive and both `Keyword value` and `Keyword=value` are accepted.
//! As in OpenSSH, the first value seen for a directive inside a block wins.
//! `Match` blocks are not evaluated: a `Match` line closes the current `Host`
//! block and everything up to the next `Host` line is skipped.

use thiserror::Error;

/// One `Host` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Patterns from the `Host` line (`*`, exact names, negations).
    pub patterns: Vec<String>,
    pub host_name: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<String>,
    pub port: Option<u16>,
}

impl ConfigEntry {
    /// True when `host` equals one of the literal patterns or the `HostName`.
    pub fn matches_exactly(&self, host: &str) -> bool {
        let pattern_hit = self
            .patterns
            .iter()
            .filter(|p| !is_glob(p))
            .any(|p| p.eq_ignore_ascii_case(host));

        pattern_hit
            || self
                .host_name
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(host))
    }

    /// True for a catch-all `Host *` block.
    pub fn is_wildcard(&self) -> bool {
        self.patterns.iter().any(|p| p == "*")
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.starts_with('!') || pattern.contains('*') || pattern.contains('?')
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Host directive requires at least one pattern at line {line}")]
    MissingPattern { line: usize },

    #[error("{keyword} requires a value at line {line}")]
    MissingValue { keyword: String, line: usize },

    #[error("invalid port '{value}' at line {line}")]
    InvalidPort { value: String, line: usize },
}

/// Parse the text of an `ssh_config` file into its `Host` blocks.
pub fn parse(content: &str) -> Result<Vec<ConfigEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut current: Option<ConfigEntry> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_directive(line);
        if keyword.is_empty() {
            continue;
        }

        if keyword == "host" {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            let patterns: Vec<String> = rest
                .split_whitespace()
                .map(|p| unquote(p).to_string())
                .collect();
            if patterns.is_empty() {
                return Err(ParseError::MissingPattern { line: line_number });
            }
            current = Some(ConfigEntry {
                patterns,
                ..Default::default()
            });
            continue;
        }

        if keyword == "match" {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            tracing::debug!("Skipping Match block at line {}", line_number);
            continue;
        }

        // Global options and Match block bodies are not used
        let Some(entry) = current.as_mut() else {
            tracing::debug!(
                "Ignoring option '{}' outside a Host block at line {}",
                keyword,
                line_number
            );
            continue;
        };

        let slot = match keyword.as_str() {
            "hostname" => &mut entry.host_name,
            "user" => &mut entry.user,
            "identityfile" => &mut entry.identity_file,
            "port" => {
                let value = first_value(&keyword, rest, line_number)?;
                let port = value
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ParseError::InvalidPort {
                        value: value.to_string(),
                        line: line_number,
                    })?;
                entry.port.get_or_insert(port);
                continue;
            }
            _ => continue,
        };

        let value = first_value(&keyword, rest, line_number)?;
        slot.get_or_insert_with(|| value.to_string());
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    Ok(entries)
}

/// Split a line into a lowercase keyword and the rest of the line.
///
/// The keyword ends at the first whitespace or `=`; a single `=` between the
/// keyword and its value is dropped.
fn split_directive(line: &str) -> (String, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    (keyword.to_lowercase(), rest)
}

/// First argument of a directive; a double-quoted value may contain spaces.
fn first_value<'a>(keyword: &str, rest: &'a str, line: usize) -> Result<&'a str, ParseError> {
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split_once('"').map_or(quoted, |(v, _)| v),
        None => rest.split_whitespace().next().unwrap_or(""),
    };

    if value.is_empty() {
        return Err(ParseError::MissingValue {
            keyword: keyword.to_string(),
            line,
        });
    }
    Ok(value)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
