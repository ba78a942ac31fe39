//! Round-trip law: a policy serialized by the writer (and by the
//! detection tool) re-parses to an equal value, comment lines aside.

use isolate::detect;
use isolate::policy::model::{
    Direction, FilePerms, FileRule, NetworkRule, Policy, Principal, Protocol, ResourceLimits,
};
use isolate::policy::parser::parse_document;
use isolate::policy::writer::render_policy;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn representative_policies() -> Vec<Policy> {
    vec![
        Policy::default(),
        Policy {
            principal: Principal::Named("postgres".to_string()),
            limits: ResourceLimits {
                memory_bytes: 256 * 1024 * 1024,
                max_processes: 20,
                max_files: 512,
                max_cpu_percent: 75,
            },
            ..Policy::default()
        },
        Policy {
            workspace_path: Some(PathBuf::from("/tmp/demo")),
            env_clear: true,
            fs_default_deny: true,
            network_default_deny: true,
            env_rules: vec![
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("APP_MODE".to_string(), "production".to_string()),
            ],
            ..Policy::default()
        },
        Policy {
            network_rules: vec![
                NetworkRule {
                    protocol: Protocol::Tcp,
                    address: "0.0.0.0".to_string(),
                    port: Some(8080),
                    direction: Direction::Both,
                },
                NetworkRule {
                    protocol: Protocol::Udp,
                    address: "192.168.0.53".to_string(),
                    port: Some(53),
                    direction: Direction::Outbound,
                },
                NetworkRule {
                    protocol: Protocol::Tcp,
                    address: "10.0.0.2".to_string(),
                    port: None,
                    direction: Direction::Inbound,
                },
                NetworkRule {
                    protocol: Protocol::Unix,
                    address: "/run/db.sock".to_string(),
                    port: None,
                    direction: Direction::Both,
                },
                // A numeric field beyond the port range reads as an address.
                NetworkRule {
                    protocol: Protocol::Tcp,
                    address: "70000".to_string(),
                    port: None,
                    direction: Direction::Both,
                },
                NetworkRule {
                    protocol: Protocol::None,
                    address: String::new(),
                    port: None,
                    direction: Direction::Both,
                },
            ],
            file_rules: vec![
                FileRule {
                    path: PathBuf::from("/etc/ssl"),
                    perms: FilePerms::READ_ONLY,
                },
                FileRule {
                    path: PathBuf::from("/var/lib/app"),
                    perms: FilePerms {
                        read: true,
                        write: true,
                        execute: true,
                    },
                },
            ],
            ..Policy::default()
        },
    ]
}

#[test]
fn writer_output_reparses_equal() {
    for policy in representative_policies() {
        let document = render_policy(&policy);
        let reparsed = parse_document(&document);
        assert_eq!(reparsed, policy, "document was:\n{}", document);
    }
}

#[test]
fn rendering_is_a_fixed_point() {
    for policy in representative_policies() {
        let once = render_policy(&policy);
        let twice = render_policy(&parse_document(&once));
        assert_eq!(once, twice);
    }
}

#[test]
fn detector_document_reparses_to_its_computed_policy() {
    let dir = TempDir::new().unwrap();
    let binary = dir.path().join("web-client");
    fs::write(
        &binary,
        b"\x7fELF\x02\x01libc.so.6\x00libssl.so.3\x00socket\x00connect\x00https://example.com\x00/etc/app.conf\x00",
    )
    .unwrap();

    let (computed, hints) = detect::detect_policy(&binary).unwrap();
    assert!(!hints.is_empty());

    let output = dir.path().join("web-client.caps");
    let written = detect::detect_capabilities(&binary, Some(&output)).unwrap();
    assert_eq!(written, output);

    let reparsed = parse_document(&fs::read_to_string(&output).unwrap());
    assert_eq!(reparsed, computed);

    // The draft keeps the auto principal and baseline limits.
    assert_eq!(computed.principal, Principal::EphemeralAuto);
    assert!(computed.limits.memory_bytes > 0);
    assert!(computed.limits.max_files > 0);
}

#[test]
fn detection_defaults_to_binary_dot_caps() {
    let dir = TempDir::new().unwrap();
    let binary = dir.path().join("tool");
    fs::write(&binary, b"\x00plain\x00").unwrap();

    let written = detect::detect_capabilities(&binary, None).unwrap();
    assert_eq!(written, dir.path().join("tool.caps"));
    assert!(written.is_file());
}
