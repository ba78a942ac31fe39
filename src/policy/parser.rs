/// Line-oriented capability document parser.
///
/// The format is `key: value` per line, `#` starts a comment, blank
/// lines are ignored. Parsing is total: malformed values and unknown
/// keys emit warnings and are skipped, never aborting the parse.
use crate::policy::model::{
    Direction, FilePerms, FileRule, NetworkRule, Policy, Principal, Protocol, MAX_ENV_RULES,
    MAX_FILE_RULES, MAX_NETWORK_RULES,
};
use crate::types::{IsolateError, Result};
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

/// Read a capability document from disk.
///
/// A missing or unreadable file is recoverable when the path was merely
/// the `<binary>.caps` default: the invocation proceeds under the
/// default policy with a warning. When the caller named the file
/// explicitly, the same condition is a `PolicyParse` error.
pub fn load(path: &Path, explicit: bool) -> Result<Policy> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_document(&text)),
        Err(err) if explicit => Err(IsolateError::PolicyParse(format!(
            "{}: {}",
            path.display(),
            err
        ))),
        Err(_) => {
            warn!(
                "no capability file at {}; running under the default policy",
                path.display()
            );
            Ok(Policy::default())
        }
    }
}

/// Parse document text into a policy. Always yields a `Policy`.
pub fn parse_document(text: &str) -> Policy {
    let mut policy = Policy::default();

    for (idx, raw) in text.lines().enumerate() {
        let line_num = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            warn!("line {}: invalid syntax (expected key: value): {}", line_num, line);
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "user" => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    warn!("line {}: invalid user name: {:?}", line_num, value);
                } else if value == "auto" {
                    policy.principal = Principal::EphemeralAuto;
                } else {
                    policy.principal = Principal::Named(value.to_string());
                }
            }
            "memory" => match parse_memory_size(value) {
                Some(bytes) if bytes == 0 || bytes >= crate::kernel::page_size() => {
                    policy.limits.memory_bytes = bytes;
                }
                Some(bytes) => {
                    warn!(
                        "line {}: memory limit {} is below one system page, ignored",
                        line_num, bytes
                    );
                }
                None => warn!("line {}: invalid memory size: {}", line_num, value),
            },
            "processes" => match value.parse::<u32>() {
                Ok(n) => policy.limits.max_processes = n,
                Err(_) => warn!("line {}: invalid process limit: {}", line_num, value),
            },
            "files" => match value.parse::<u32>() {
                Ok(n) => policy.limits.max_files = n,
                Err(_) => warn!("line {}: invalid file limit: {}", line_num, value),
            },
            "cpu" => match value.parse::<u32>() {
                Ok(n) => policy.limits.max_cpu_percent = n,
                Err(_) => warn!("line {}: invalid cpu limit: {}", line_num, value),
            },
            "network" => {
                if policy.network_rules.len() >= MAX_NETWORK_RULES {
                    warn!(
                        "line {}: more than {} network rules, discarding: {}",
                        line_num, MAX_NETWORK_RULES, value
                    );
                } else {
                    match parse_network_rule(value) {
                        Some(rule) => policy.network_rules.push(rule),
                        None => warn!("line {}: invalid network rule: {}", line_num, value),
                    }
                }
            }
            "filesystem" | "file" => {
                if policy.file_rules.len() >= MAX_FILE_RULES {
                    warn!(
                        "line {}: more than {} file rules, discarding: {}",
                        line_num, MAX_FILE_RULES, value
                    );
                } else {
                    match parse_file_rule(value) {
                        Some(rule) => policy.file_rules.push(rule),
                        None => warn!("line {}: invalid file rule: {}", line_num, value),
                    }
                }
            }
            "env" => {
                if policy.env_rules.len() >= MAX_ENV_RULES {
                    warn!(
                        "line {}: more than {} env rules, discarding: {}",
                        line_num, MAX_ENV_RULES, value
                    );
                } else {
                    match value.split_once('=') {
                        Some((name, val)) if !name.trim().is_empty() => {
                            policy
                                .env_rules
                                .push((name.trim().to_string(), val.to_string()));
                        }
                        _ => warn!("line {}: invalid env rule (want NAME=VALUE): {}", line_num, value),
                    }
                }
            }
            "network_default" => match value {
                "deny" => policy.network_default_deny = true,
                "allow" => policy.network_default_deny = false,
                _ => warn!("line {}: invalid network_default (deny|allow): {}", line_num, value),
            },
            "filesystem_default" => match value {
                "deny" => policy.fs_default_deny = true,
                "allow" => policy.fs_default_deny = false,
                _ => warn!(
                    "line {}: invalid filesystem_default (deny|allow): {}",
                    line_num, value
                ),
            },
            "env_clear" => match value {
                "true" | "1" => policy.env_clear = true,
                "false" | "0" => policy.env_clear = false,
                _ => warn!("line {}: invalid env_clear (true|false|1|0): {}", line_num, value),
            },
            "workspace" => match normalize_path(value) {
                Some(path) => policy.workspace_path = Some(path),
                None => warn!("line {}: workspace must be an absolute path: {}", line_num, value),
            },
            _ => warn!("line {}: unknown capability key: {}", line_num, key),
        }
    }

    policy
}

/// Parse a size with optional `B`/`K`/`M`/`G` suffix (case-insensitive,
/// default bytes). Fractional values are accepted: `1.5G`.
pub fn parse_memory_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let base: f64 = number.parse().ok()?;

    let multiplier: f64 = match suffix.trim() {
        "" => 1.0,
        s if s.eq_ignore_ascii_case("b") => 1.0,
        s if s.eq_ignore_ascii_case("k") => 1024.0,
        s if s.eq_ignore_ascii_case("m") => 1024.0 * 1024.0,
        s if s.eq_ignore_ascii_case("g") => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((base * multiplier) as u64)
}

/// Parse one network rule: `protocol[:first[:second[:direction]]]`.
pub fn parse_network_rule(value: &str) -> Option<NetworkRule> {
    let value = value.trim();
    if value == "none" {
        return Some(NetworkRule {
            protocol: Protocol::None,
            address: String::new(),
            port: None,
            direction: Direction::Both,
        });
    }

    let mut fields = value.split(':');
    let proto = fields.next()?;
    let rest: Vec<&str> = fields.collect();

    match proto {
        "unix" => {
            if rest.len() != 1 || rest[0].is_empty() {
                return None;
            }
            Some(NetworkRule {
                protocol: Protocol::Unix,
                address: rest[0].to_string(),
                port: None,
                direction: Direction::Both,
            })
        }
        "tcp" | "udp" => {
            let protocol = if proto == "tcp" {
                Protocol::Tcp
            } else {
                Protocol::Udp
            };
            let mut address = String::from("0.0.0.0");
            let mut port = None;
            let mut direction = Direction::Both;

            if !rest.is_empty() {
                let first = rest[0];
                if rest.len() == 1 && !first.is_empty() && first.chars().all(|c| c.is_ascii_digit())
                {
                    match parse_port(first) {
                        // Lone in-range numeric field is the port; the
                        // address stays wild.
                        Some(p) => port = Some(p),
                        // Out of range means it is not a port at all; the
                        // field is an address.
                        None => address = first.to_string(),
                    }
                } else {
                    if first.is_empty() {
                        return None;
                    }
                    address = first.to_string();
                    let mut idx = 1;
                    if idx < rest.len() && rest[idx].chars().all(|c| c.is_ascii_digit()) {
                        port = Some(parse_port(rest[idx])?);
                        idx += 1;
                    }
                    if idx < rest.len() {
                        direction = parse_direction(rest[idx]);
                        idx += 1;
                    }
                    if idx != rest.len() {
                        return None;
                    }
                }
            }

            Some(NetworkRule {
                protocol,
                address,
                port,
                direction,
            })
        }
        _ => None,
    }
}

fn parse_port(field: &str) -> Option<u16> {
    match field.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Some(port as u16),
        _ => None,
    }
}

fn parse_direction(field: &str) -> Direction {
    match field {
        "out" | "outbound" => Direction::Outbound,
        "in" | "inbound" => Direction::Inbound,
        _ => Direction::Both,
    }
}

/// Parse one file rule: `path[:perms]`, perms a subset of `rwxRWX`,
/// default read-only.
pub fn parse_file_rule(value: &str) -> Option<FileRule> {
    let (path_part, perms_part) = match value.split_once(':') {
        Some((path, perms)) => (path, Some(perms)),
        None => (value, None),
    };

    let path = normalize_path(path_part.trim())?;
    let perms = match perms_part {
        None => FilePerms::READ_ONLY,
        Some(p) if p.trim().is_empty() => FilePerms::READ_ONLY,
        Some(p) => {
            let mut perms = FilePerms::default();
            for c in p.trim().chars() {
                match c {
                    'r' | 'R' => perms.read = true,
                    'w' | 'W' => perms.write = true,
                    'x' | 'X' => perms.execute = true,
                    _ => return None,
                }
            }
            perms
        }
    };

    Some(FileRule { path, perms })
}

/// Lexically canonicalize an absolute path: `.` and `..` resolved,
/// duplicate and trailing slashes removed. Relative paths are rejected.
pub fn normalize_path(value: &str) -> Option<PathBuf> {
    if !value.starts_with('/') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in value.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    let mut path = String::from("/");
    path.push_str(&parts.join("/"));
    Some(PathBuf::from(path))
}
