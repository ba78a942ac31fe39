//! Capability detection: inspects a binary and writes a draft policy
//! document for the operator to review.
//!
//! Three heuristic passes run in-process over the binary image:
//! embedded strings (library sonames, absolute paths, URLs), coarse
//! symbol-name checks, and basename pattern matching. The draft is
//! composed as a real `Policy` and rendered through the policy writer,
//! so re-parsing the generated document yields the computed policy.

use crate::policy::model::{
    Direction, FilePerms, FileRule, NetworkRule, Policy, Protocol, MAX_ENV_RULES, MAX_FILE_RULES,
    MAX_NETWORK_RULES,
};
use crate::policy::writer::render_policy;
use crate::types::{IsolateError, Result};
use log::debug;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on path/URL hints harvested from embedded strings.
const MAX_STRING_HINTS: usize = 20;

/// Draft baseline written before any detected capability.
const BASELINE_MEMORY: u64 = 128 * 1024 * 1024;
const BASELINE_PROCESSES: u32 = 5;
const BASELINE_FILES: u32 = 256;

/// One detected capability suggestion.
#[derive(Clone, Debug)]
pub struct Hint {
    pub description: String,
    /// Confidence percentage, 0–100.
    pub confidence: u8,
    pub effects: Vec<Effect>,
}

/// Concrete policy change a hint proposes.
#[derive(Clone, Debug)]
pub enum Effect {
    Network(NetworkRule),
    File(FileRule),
    Env(String, String),
    Memory(u64),
    Processes(u32),
}

/// Analyse `binary` and compute a draft policy plus the hints behind it.
pub fn detect_policy(binary: &Path) -> Result<(Policy, Vec<Hint>)> {
    let bytes =
        fs::read(binary).map_err(|e| IsolateError::primitive("detect_read", e))?;
    let strings = printable_strings(&bytes, 4);

    let mut hints = Vec::new();
    soname_hints(&strings, &mut hints);
    symbol_hints(&strings, &mut hints);
    string_hints(&strings, &mut hints);
    basename_hints(binary, &mut hints);

    if hints.is_empty() {
        debug!("no specific capabilities detected, suggesting minimal defaults");
        hints.push(Hint {
            description: "Minimal capabilities for an unknown application".to_string(),
            confidence: 50,
            effects: vec![Effect::File(file_rule("/tmp", true))],
        });
    }

    hints.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    Ok((compose_policy(&hints), hints))
}

/// Analyse `binary` and write the draft document to `output`
/// (default `<binary>.caps`). Returns the path written.
pub fn detect_capabilities(binary: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let (policy, hints) = detect_policy(binary)?;

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let mut path = binary.as_os_str().to_owned();
            path.push(".caps");
            PathBuf::from(path)
        }
    };

    let mut doc = String::new();
    doc.push_str(&format!(
        "# Auto-generated capability file for {}\n",
        binary.display()
    ));
    doc.push_str("# Review the suggestions and remove anything the application\n");
    doc.push_str("# does not actually need.\n#\n");
    for hint in &hints {
        doc.push_str(&format!(
            "# {} (confidence {}%)\n",
            hint.description, hint.confidence
        ));
    }
    doc.push('\n');
    doc.push_str(&render_policy(&policy));
    doc.push_str("\n# Additional capability examples:\n");
    doc.push_str("# network: udp:0.0.0.0:53:outbound\n");
    doc.push_str("# filesystem: /home/user:rw\n");
    doc.push_str("# env: PATH=/usr/bin:/bin\n");
    doc.push_str("# cpu: 50\n");

    fs::write(&output, doc).map_err(|e| IsolateError::primitive("detect_write", e))?;
    Ok(output)
}

/// Fold hints into one draft policy. Higher-confidence hints win the
/// scalar limits; rules are deduplicated and bounded by the policy caps.
fn compose_policy(hints: &[Hint]) -> Policy {
    let mut policy = Policy::default();
    let mut seen_network = HashSet::new();
    let mut seen_files = HashSet::new();
    let mut seen_env = HashSet::new();

    for hint in hints {
        for effect in &hint.effects {
            match effect {
                Effect::Network(rule) => {
                    let key = crate::policy::writer::render_network_rule(rule);
                    if policy.network_rules.len() < MAX_NETWORK_RULES && seen_network.insert(key) {
                        policy.network_rules.push(rule.clone());
                    }
                }
                Effect::File(rule) => {
                    if policy.file_rules.len() < MAX_FILE_RULES
                        && seen_files.insert(rule.path.clone())
                    {
                        policy.file_rules.push(rule.clone());
                    }
                }
                Effect::Env(name, value) => {
                    if policy.env_rules.len() < MAX_ENV_RULES && seen_env.insert(name.clone()) {
                        policy.env_rules.push((name.clone(), value.clone()));
                    }
                }
                Effect::Memory(bytes) => {
                    if policy.limits.memory_bytes == 0 {
                        policy.limits.memory_bytes = *bytes;
                    }
                }
                Effect::Processes(count) => {
                    if policy.limits.max_processes == 0 {
                        policy.limits.max_processes = *count;
                    }
                }
            }
        }
    }

    if policy.limits.memory_bytes == 0 {
        policy.limits.memory_bytes = BASELINE_MEMORY;
    }
    if policy.limits.max_processes == 0 {
        policy.limits.max_processes = BASELINE_PROCESSES;
    }
    if policy.limits.max_files == 0 {
        policy.limits.max_files = BASELINE_FILES;
    }

    policy
}

/// Printable-ASCII runs of at least `min_len` bytes.
fn printable_strings(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for &byte in bytes {
        if (0x20..0x7f).contains(&byte) {
            current.push(byte);
        } else {
            if current.len() >= min_len {
                out.push(String::from_utf8_lossy(&current).into_owned());
            }
            current.clear();
        }
    }
    if current.len() >= min_len {
        out.push(String::from_utf8_lossy(&current).into_owned());
    }
    out
}

fn contains(strings: &[String], needle: &str) -> bool {
    strings.iter().any(|s| s.contains(needle))
}

fn tcp_out(port: u16) -> NetworkRule {
    NetworkRule {
        protocol: Protocol::Tcp,
        address: "0.0.0.0".to_string(),
        port: Some(port),
        direction: Direction::Outbound,
    }
}

fn tcp_in(port: u16) -> NetworkRule {
    NetworkRule {
        protocol: Protocol::Tcp,
        address: "0.0.0.0".to_string(),
        port: Some(port),
        direction: Direction::Inbound,
    }
}

fn file_rule(path: &str, writable: bool) -> FileRule {
    FileRule {
        path: PathBuf::from(path),
        perms: FilePerms {
            read: true,
            write: writable,
            execute: false,
        },
    }
}

/// Library sonames embedded in the dynamic section.
fn soname_hints(strings: &[String], hints: &mut Vec<Hint>) {
    if contains(strings, "libc.so") {
        hints.push(Hint {
            description: "Standard C library: loader and system libraries".to_string(),
            confidence: 95,
            effects: vec![
                Effect::File(file_rule("/lib", false)),
                Effect::File(file_rule("/usr/lib", false)),
                Effect::File(file_rule("/usr/local/lib", false)),
                Effect::File(file_rule("/libexec", false)),
            ],
        });
    }
    if contains(strings, "libssl") || contains(strings, "libcrypto") {
        hints.push(Hint {
            description: "TLS library: likely outbound HTTPS".to_string(),
            confidence: 80,
            effects: vec![Effect::Network(tcp_out(443)), Effect::Network(tcp_out(80))],
        });
    }
    if contains(strings, "libcurl") {
        hints.push(Hint {
            description: "HTTP client library".to_string(),
            confidence: 85,
            effects: vec![Effect::Network(tcp_out(80)), Effect::Network(tcp_out(443))],
        });
    }
    if contains(strings, "libpq") {
        hints.push(Hint {
            description: "PostgreSQL client library".to_string(),
            confidence: 85,
            effects: vec![Effect::Network(tcp_out(5432))],
        });
    }
    if contains(strings, "libmysql") || contains(strings, "libmariadb") {
        hints.push(Hint {
            description: "MySQL client library".to_string(),
            confidence: 85,
            effects: vec![Effect::Network(tcp_out(3306))],
        });
    }
    if contains(strings, "libX11") || contains(strings, "libgtk") || contains(strings, "libQt") {
        hints.push(Hint {
            description: "GUI library: needs the X11 socket directory".to_string(),
            confidence: 90,
            effects: vec![
                Effect::File(file_rule("/tmp/.X11-unix", true)),
                Effect::Env("DISPLAY".to_string(), ":0".to_string()),
            ],
        });
    }
}

/// Coarse checks against symbol names visible in the string table.
fn symbol_hints(strings: &[String], hints: &mut Vec<Hint>) {
    let has_socket = contains(strings, "socket");
    let has_bind = contains(strings, "bind") || contains(strings, "listen");
    let has_file_ops = contains(strings, "open")
        || contains(strings, "read")
        || contains(strings, "write");
    let has_process = contains(strings, "fork") || contains(strings, "execve");

    if has_socket && has_bind {
        hints.push(Hint {
            description: "Listening socket operations detected".to_string(),
            confidence: 85,
            effects: vec![Effect::Network(tcp_in(8080))],
        });
    } else if has_socket {
        hints.push(Hint {
            description: "Client socket operations detected".to_string(),
            confidence: 75,
            effects: vec![Effect::Network(tcp_out(80))],
        });
    }
    if has_file_ops {
        hints.push(Hint {
            description: "File operations detected".to_string(),
            confidence: 70,
            effects: vec![Effect::File(file_rule("/tmp", true))],
        });
    }
    if has_process {
        hints.push(Hint {
            description: "Process management detected".to_string(),
            confidence: 80,
            effects: vec![Effect::Processes(10)],
        });
    }
}

/// Absolute paths and URLs carried in the binary's strings.
fn string_hints(strings: &[String], hints: &mut Vec<Hint>) {
    let mut harvested = 0;
    let mut saw_url = false;

    for candidate in strings {
        if harvested >= MAX_STRING_HINTS {
            break;
        }
        if candidate.len() > 200 {
            continue;
        }
        if let Some(path) = exact_path(candidate, "/etc/") {
            hints.push(Hint {
                description: format!("Configuration file reference: {}", path),
                confidence: 60,
                effects: vec![Effect::File(file_rule(&path, false))],
            });
            harvested += 1;
        } else if let Some(path) = exact_path(candidate, "/var/") {
            hints.push(Hint {
                description: format!("Data directory reference: {}", path),
                confidence: 65,
                effects: vec![Effect::File(file_rule(&path, true))],
            });
            harvested += 1;
        } else if !saw_url
            && (candidate.starts_with("http://") || candidate.starts_with("https://"))
        {
            hints.push(Hint {
                description: "HTTP URL embedded in the binary".to_string(),
                confidence: 70,
                effects: vec![Effect::Network(tcp_out(80)), Effect::Network(tcp_out(443))],
            });
            saw_url = true;
            harvested += 1;
        }
    }
}

/// A candidate string that is exactly one well-formed absolute path
/// under `prefix`.
fn exact_path(candidate: &str, prefix: &str) -> Option<String> {
    if !candidate.starts_with(prefix) {
        return None;
    }
    if candidate
        .chars()
        .any(|c| c.is_whitespace() || c == '%' || c == ':')
    {
        return None;
    }
    crate::policy::parser::normalize_path(candidate).map(|p| p.display().to_string())
}

/// Well-known application name patterns.
fn basename_hints(binary: &Path, hints: &mut Vec<Hint>) {
    let Some(basename) = binary.file_name().and_then(|n| n.to_str()) else {
        return;
    };

    struct Pattern {
        needle: &'static str,
        description: &'static str,
        confidence: u8,
        effects: fn() -> Vec<Effect>,
    }

    let patterns = [
        Pattern {
            needle: "nginx",
            description: "Nginx web server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(80)),
                    Effect::Network(tcp_in(443)),
                    Effect::File(file_rule("/var/www", false)),
                    Effect::Memory(128 * 1024 * 1024),
                ]
            },
        },
        Pattern {
            needle: "httpd",
            description: "Web server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(80)),
                    Effect::Network(tcp_in(443)),
                    Effect::File(file_rule("/var/www", false)),
                    Effect::Memory(256 * 1024 * 1024),
                ]
            },
        },
        Pattern {
            needle: "apache",
            description: "Apache web server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(80)),
                    Effect::Network(tcp_in(443)),
                    Effect::File(file_rule("/var/www", false)),
                    Effect::Memory(256 * 1024 * 1024),
                ]
            },
        },
        Pattern {
            needle: "sshd",
            description: "SSH server",
            confidence: 95,
            effects: || {
                vec![
                    Effect::Network(tcp_in(22)),
                    Effect::File(file_rule("/etc/ssh", false)),
                    Effect::Processes(20),
                ]
            },
        },
        Pattern {
            needle: "mysqld",
            description: "MySQL database server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(3306)),
                    Effect::File(file_rule("/var/lib/mysql", true)),
                    Effect::Memory(512 * 1024 * 1024),
                    Effect::Processes(50),
                ]
            },
        },
        Pattern {
            needle: "postgres",
            description: "PostgreSQL database server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(5432)),
                    Effect::File(file_rule("/var/lib/postgresql", true)),
                    Effect::Memory(256 * 1024 * 1024),
                    Effect::Processes(20),
                ]
            },
        },
        Pattern {
            needle: "redis",
            description: "Redis server",
            confidence: 90,
            effects: || {
                vec![
                    Effect::Network(tcp_in(6379)),
                    Effect::File(file_rule("/var/lib/redis", true)),
                    Effect::Memory(128 * 1024 * 1024),
                ]
            },
        },
        Pattern {
            needle: "server",
            description: "Generic server application",
            confidence: 60,
            effects: || vec![Effect::Network(tcp_in(8080)), Effect::Memory(128 * 1024 * 1024)],
        },
        Pattern {
            needle: "client",
            description: "Generic client application",
            confidence: 60,
            effects: || vec![Effect::Network(tcp_out(80)), Effect::Network(tcp_out(443))],
        },
        Pattern {
            needle: "daemon",
            description: "System daemon",
            confidence: 70,
            effects: || {
                vec![
                    Effect::Processes(5),
                    Effect::File(file_rule("/var/run", true)),
                    Effect::File(file_rule("/var/log", true)),
                ]
            },
        },
        Pattern {
            needle: "bot",
            description: "Bot application",
            confidence: 65,
            effects: || {
                vec![
                    Effect::Network(tcp_out(443)),
                    Effect::File(file_rule("/tmp", true)),
                    Effect::Memory(64 * 1024 * 1024),
                ]
            },
        },
    ];

    for pattern in patterns {
        if basename.contains(pattern.needle) {
            hints.push(Hint {
                description: pattern.description.to_string(),
                confidence: pattern.confidence,
                effects: (pattern.effects)(),
            });
            break;
        }
    }
}
