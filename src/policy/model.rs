/// In-memory capability policy model
use crate::types::{IsolateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Hard cap on network rules per policy; excess entries are discarded.
pub const MAX_NETWORK_RULES: usize = 16;
/// Hard cap on file rules per policy.
pub const MAX_FILE_RULES: usize = 32;
/// Hard cap on injected environment variables.
pub const MAX_ENV_RULES: usize = 32;

/// Identity the payload runs as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    /// Synthesize a fresh per-invocation principal and destroy it afterward.
    EphemeralAuto,
    /// Use an existing principal on the host; its absence is a policy violation.
    Named(String),
}

/// Requested access to a single host path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl FilePerms {
    pub const READ_ONLY: FilePerms = FilePerms {
        read: true,
        write: false,
        execute: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.read || self.write || self.execute)
    }
}

impl fmt::Display for FilePerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            write!(f, "r")?;
        }
        if self.write {
            write!(f, "w")?;
        }
        if self.execute {
            write!(f, "x")?;
        }
        Ok(())
    }
}

/// One filesystem capability: expose `path` inside the sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRule {
    /// Absolute, lexically canonical host path.
    pub path: PathBuf,
    pub perms: FilePerms,
}

/// Transport selector for a network rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
    /// Explicit no-network marker.
    None,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Unix => "unix",
            Protocol::None => "none",
        }
    }
}

/// Traffic direction a network rule applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Both,
    Outbound,
    Inbound,
}

/// One network capability. Retained on the policy and surfaced in
/// diagnostics; binding rules to a host firewall is a known gap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub protocol: Protocol,
    /// IP address, or socket path when `protocol` is `Unix`.
    pub address: String,
    /// `None` means any port.
    pub port: Option<u16>,
    pub direction: Direction,
}

/// Resource accounting limits; `0` means unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub max_processes: u32,
    pub max_files: u32,
    pub max_cpu_percent: u32,
}

impl ResourceLimits {
    pub fn is_unset(&self) -> bool {
        self.memory_bytes == 0
            && self.max_processes == 0
            && self.max_files == 0
            && self.max_cpu_percent == 0
    }
}

/// Parsed capability document. Immutable after parse; shared read-only
/// by every component of the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub principal: Principal,
    /// Host directory bound read-write at the fixed `/workspace` mount point.
    pub workspace_path: Option<PathBuf>,
    pub file_rules: Vec<FileRule>,
    pub network_rules: Vec<NetworkRule>,
    pub env_rules: Vec<(String, String)>,
    /// When true the payload starts from an empty environment plus the
    /// injected pairs and the minimal defaults.
    pub env_clear: bool,
    /// Accepted and reserved; effective filesystem behavior is always
    /// default-deny (only declared paths are mounted).
    pub fs_default_deny: bool,
    /// Accepted and reserved, see `fs_default_deny`.
    pub network_default_deny: bool,
    pub limits: ResourceLimits,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            principal: Principal::EphemeralAuto,
            workspace_path: None,
            file_rules: Vec::new(),
            network_rules: Vec::new(),
            env_rules: Vec::new(),
            env_clear: false,
            fs_default_deny: false,
            network_default_deny: false,
            limits: ResourceLimits::default(),
        }
    }
}

impl Policy {
    /// Re-check the structural invariants a parsed policy must satisfy.
    /// The parser establishes these by skipping offending lines; this is
    /// the backstop for policies constructed programmatically.
    pub fn validate(&self) -> Result<()> {
        if self.limits.memory_bytes > 0 && self.limits.memory_bytes < crate::kernel::page_size() {
            return Err(IsolateError::PolicyViolation(format!(
                "memory limit {} is below one system page",
                self.limits.memory_bytes
            )));
        }
        if let Principal::Named(name) = &self.principal {
            if name.is_empty() {
                return Err(IsolateError::PolicyViolation(
                    "named principal is empty".to_string(),
                ));
            }
        }
        for rule in &self.file_rules {
            if !rule.path.is_absolute() {
                return Err(IsolateError::PolicyViolation(format!(
                    "file rule path is not absolute: {}",
                    rule.path.display()
                )));
            }
        }
        for rule in &self.network_rules {
            if rule.protocol == Protocol::Unix && rule.port.is_some() {
                return Err(IsolateError::PolicyViolation(format!(
                    "unix socket rule carries a port: {}",
                    rule.address
                )));
            }
        }
        Ok(())
    }

    /// Human-readable summary, printed by verbose and dry-run modes.
    pub fn describe(&self) -> String {
        let mut out = String::from("Capabilities:\n");
        match &self.principal {
            Principal::EphemeralAuto => out.push_str("  User: auto (ephemeral)\n"),
            Principal::Named(name) => out.push_str(&format!("  User: {}\n", name)),
        }
        if let Some(workspace) = &self.workspace_path {
            out.push_str(&format!("  Workspace: {}\n", workspace.display()));
        }
        if self.limits.memory_bytes > 0 {
            out.push_str(&format!("  Memory: {} bytes\n", self.limits.memory_bytes));
        }
        if self.limits.max_processes > 0 {
            out.push_str(&format!("  Processes: {}\n", self.limits.max_processes));
        }
        if self.limits.max_files > 0 {
            out.push_str(&format!("  Files: {}\n", self.limits.max_files));
        }
        if self.limits.max_cpu_percent > 0 {
            out.push_str(&format!("  CPU: {}%\n", self.limits.max_cpu_percent));
        }
        out.push_str(&format!("  Network rules: {}\n", self.network_rules.len()));
        for rule in &self.network_rules {
            out.push_str(&format!("    {}\n", writer_rule(rule)));
        }
        out.push_str(&format!("  File rules: {}\n", self.file_rules.len()));
        for rule in &self.file_rules {
            out.push_str(&format!("    {} ({})\n", rule.path.display(), rule.perms));
        }
        if !self.env_rules.is_empty() {
            out.push_str(&format!("  Environment: {} injected\n", self.env_rules.len()));
        }
        if self.env_clear {
            out.push_str("  Environment cleared before injection\n");
        }
        out
    }
}

fn writer_rule(rule: &NetworkRule) -> String {
    crate::policy::writer::render_network_rule(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_permissive() {
        let policy = Policy::default();
        assert_eq!(policy.principal, Principal::EphemeralAuto);
        assert!(!policy.env_clear);
        assert!(!policy.fs_default_deny);
        assert!(!policy.network_default_deny);
        assert!(policy.limits.is_unset());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn validate_rejects_sub_page_memory() {
        let policy = Policy {
            limits: ResourceLimits {
                memory_bytes: 100,
                ..ResourceLimits::default()
            },
            ..Policy::default()
        };
        let err = policy.validate().unwrap_err();
        assert_eq!(err.kind(), "PolicyViolation");
    }

    #[test]
    fn validate_rejects_relative_file_rule() {
        let policy = Policy {
            file_rules: vec![FileRule {
                path: PathBuf::from("tmp/data"),
                perms: FilePerms::READ_ONLY,
            }],
            ..Policy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn perms_render_as_subset() {
        let perms = FilePerms {
            read: true,
            write: true,
            execute: false,
        };
        assert_eq!(perms.to_string(), "rw");
        assert_eq!(FilePerms::READ_ONLY.to_string(), "r");
    }
}
