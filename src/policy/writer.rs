/// Renders a policy back to capability document text.
///
/// Output is canonical with respect to the parser: re-parsing a
/// rendered document yields an equal `Policy` (comment lines aside).
use crate::policy::model::{Direction, FileRule, NetworkRule, Policy, Principal, Protocol};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Render the whole policy as document lines.
pub fn render_policy(policy: &Policy) -> String {
    let mut out = String::new();

    match &policy.principal {
        Principal::EphemeralAuto => out.push_str("user: auto\n"),
        Principal::Named(name) => out.push_str(&format!("user: {}\n", name)),
    }

    if policy.limits.memory_bytes > 0 {
        out.push_str(&format!(
            "memory: {}\n",
            render_memory(policy.limits.memory_bytes)
        ));
    }
    if policy.limits.max_processes > 0 {
        out.push_str(&format!("processes: {}\n", policy.limits.max_processes));
    }
    if policy.limits.max_files > 0 {
        out.push_str(&format!("files: {}\n", policy.limits.max_files));
    }
    if policy.limits.max_cpu_percent > 0 {
        out.push_str(&format!("cpu: {}\n", policy.limits.max_cpu_percent));
    }
    if let Some(workspace) = &policy.workspace_path {
        out.push_str(&format!("workspace: {}\n", workspace.display()));
    }
    if policy.network_default_deny {
        out.push_str("network_default: deny\n");
    }
    if policy.fs_default_deny {
        out.push_str("filesystem_default: deny\n");
    }
    if policy.env_clear {
        out.push_str("env_clear: true\n");
    }

    for rule in &policy.network_rules {
        out.push_str(&format!("network: {}\n", render_network_rule(rule)));
    }
    for rule in &policy.file_rules {
        out.push_str(&format!("filesystem: {}\n", render_file_rule(rule)));
    }
    for (name, value) in &policy.env_rules {
        out.push_str(&format!("env: {}={}\n", name, value));
    }

    out
}

/// Render a byte count with the largest suffix that divides it evenly.
pub fn render_memory(bytes: u64) -> String {
    if bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        format!("{}", bytes)
    }
}

pub fn render_network_rule(rule: &NetworkRule) -> String {
    match rule.protocol {
        Protocol::None => "none".to_string(),
        Protocol::Unix => format!("unix:{}", rule.address),
        Protocol::Tcp | Protocol::Udp => {
            let proto = rule.protocol.as_str();
            if rule.address == "0.0.0.0"
                && rule.port.is_some()
                && rule.direction == Direction::Both
            {
                return format!("{}:{}", proto, rule.port.unwrap());
            }
            let mut out = format!("{}:{}", proto, rule.address);
            if let Some(port) = rule.port {
                out.push_str(&format!(":{}", port));
            }
            match rule.direction {
                Direction::Both => {}
                Direction::Outbound => out.push_str(":outbound"),
                Direction::Inbound => out.push_str(":inbound"),
            }
            out
        }
    }
}

pub fn render_file_rule(rule: &FileRule) -> String {
    format!("{}:{}", rule.path.display(), rule.perms)
}
