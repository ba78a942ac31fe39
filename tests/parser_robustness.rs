//! Parser robustness: for any document, parsing terminates and yields a
//! policy; ill-formed lines warn and are skipped, never aborting.

use isolate::policy::model::{Policy, Principal};
use isolate::policy::parser::parse_document;

#[test]
fn a_fully_loaded_document_parses() {
    let policy = parse_document(
        "\
# demo service capabilities
user: auto
memory: 64M
processes: 5
files: 256
cpu: 50
workspace: /tmp/demo
network_default: deny
filesystem_default: deny
env_clear: true
network: tcp:8080
network: udp:192.168.0.53:53:outbound
network: unix:/run/db.sock
network: none
filesystem: /etc/ssl:r
filesystem: /var/lib/app:rwx
file: /usr/share/app
env: APP_MODE=production
env: PATH=/usr/bin:/bin
",
    );

    assert_eq!(policy.principal, Principal::EphemeralAuto);
    assert_eq!(policy.limits.memory_bytes, 64 * 1024 * 1024);
    assert_eq!(policy.limits.max_processes, 5);
    assert_eq!(policy.limits.max_files, 256);
    assert_eq!(policy.limits.max_cpu_percent, 50);
    assert_eq!(policy.network_rules.len(), 4);
    assert_eq!(policy.file_rules.len(), 3);
    assert_eq!(policy.env_rules.len(), 2);
    assert!(policy.env_clear);
    assert!(policy.network_default_deny);
    assert!(policy.fs_default_deny);
}

#[test]
fn bad_lines_never_poison_good_ones() {
    let policy = parse_document(
        "\
memory: banana
user: auto
processes: minus-one
network: carrier-pigeon:12
filesystem: not-absolute:rw
env: MISSING_EQUALS
this line has no separator at all
: empty key
network: tcp:70000
memory: 64M
",
    );

    // Only the well-formed lines took effect.
    assert_eq!(policy.principal, Principal::EphemeralAuto);
    assert_eq!(policy.limits.memory_bytes, 64 * 1024 * 1024);
    assert_eq!(policy.limits.max_processes, 0);
    assert!(policy.file_rules.is_empty());
    assert!(policy.env_rules.is_empty());

    // An out-of-range numeric field is not a port, so tcp:70000 still
    // parses, with the field read as an address and the port left open.
    assert_eq!(policy.network_rules.len(), 1);
    assert_eq!(policy.network_rules[0].address, "70000");
    assert_eq!(policy.network_rules[0].port, None);
}

#[test]
fn arbitrary_bytes_terminate_with_a_policy() {
    let mut garbage = String::new();
    for i in 0..500 {
        garbage.push_str(&format!("{}:{}:{}\n", i, i * 31 % 7, "x".repeat(i % 90)));
        garbage.push_str("\u{fffd}\u{2603}::::\n");
        garbage.push_str(&":".repeat(i % 13));
        garbage.push('\n');
    }
    let policy = parse_document(&garbage);
    assert_eq!(policy, Policy::default());
}

#[test]
fn later_scalar_keys_overwrite_earlier_ones() {
    let policy = parse_document("memory: 64M\nmemory: 128M\nuser: alpha\nuser: beta\n");
    assert_eq!(policy.limits.memory_bytes, 128 * 1024 * 1024);
    assert_eq!(policy.principal, Principal::Named("beta".to_string()));
}

#[test]
fn whitespace_is_forgiven() {
    let policy = parse_document("   user :   auto   \n\tmemory\t:\t64M\n");
    assert_eq!(policy.principal, Principal::EphemeralAuto);
    assert_eq!(policy.limits.memory_bytes, 64 * 1024 * 1024);
}
