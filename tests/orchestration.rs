//! Pipeline tests for the isolation orchestrator.
//!
//! These run against the recording host, so they exercise the
//! transactional contract (acquire order, journal contents, rollback on
//! failure at each step) without requiring privileges. Root directories
//! are real paths under the system temp directory and are reclaimed by
//! rollback in every test.

use isolate::journal::JournalEntry;
use isolate::kernel::MockHost;
use isolate::orchestrator::Orchestrator;
use isolate::policy::model::{
    FilePerms, FileRule, Policy, Principal, ResourceLimits,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn payload(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("payload");
    fs::write(&path, b"#!/bin/sh\necho Hello\n").expect("write payload");
    path
}

fn recorded_root(host: &MockHost) -> Option<PathBuf> {
    host.calls().iter().find_map(|call| {
        call.strip_prefix("root_dir_create(")
            .and_then(|rest| rest.strip_suffix(')'))
            .map(PathBuf::from)
    })
}

#[test]
fn successful_provisioning_follows_the_contractual_order() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    let mut orchestrator = Orchestrator::new(&host);

    let workspace = dir.path().join("ws");
    fs::create_dir(&workspace).unwrap();
    let policy = Policy {
        workspace_path: Some(workspace),
        limits: ResourceLimits {
            memory_bytes: 64 * 1024 * 1024,
            max_processes: 4,
            ..ResourceLimits::default()
        },
        ..Policy::default()
    };

    let context = orchestrator.provision(&policy, &payload(&dir)).unwrap();

    let names = host.call_names();
    let relevant: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| {
            [
                "principal_create_ephemeral",
                "root_dir_create",
                "bind_mount",
                "overlay_mount_dev",
                "container_create",
                "accounting_add_rule",
            ]
            .contains(name)
        })
        .collect();
    assert_eq!(
        relevant,
        vec![
            "principal_create_ephemeral",
            "root_dir_create",
            "bind_mount",
            "overlay_mount_dev",
            "container_create",
            "accounting_add_rule",
            "accounting_add_rule",
        ]
    );

    // The journal mirrors the acquisitions, in order.
    let journal = orchestrator.journal_handle();
    {
        let journal = journal.lock().unwrap();
        let kinds: Vec<&str> = journal.entries().iter().map(JournalEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "PrincipalCreated",
                "RootDirCreated",
                "WorkspaceMounted",
                "DevMounted",
                "ContainerCreated",
                "AccountingRuleAdded",
                "AccountingRuleAdded",
            ]
        );
    }

    // Names all derive from the tag.
    let unit = format!("isolate-{}", context.tag);
    assert_eq!(context.principal_name, unit);
    assert_eq!(context.container.name(), unit);
    assert!(context.root_path.ends_with(&unit));

    // Skeleton, payload copy and identity stubs are in place.
    for subdir in ["bin", "dev", "tmp", "etc", "var/log", "workspace"] {
        assert!(context.root_path.join(subdir).is_dir(), "missing {}", subdir);
    }
    assert!(context.root_path.join("payload").is_file());
    let passwd = fs::read_to_string(context.root_path.join("etc/passwd")).unwrap();
    assert_eq!(passwd.lines().count(), 2);
    assert!(passwd.lines().next().unwrap().starts_with("root:"));
    assert!(passwd.contains(&unit));
    let group = fs::read_to_string(context.root_path.join("etc/group")).unwrap();
    assert_eq!(group.lines().count(), 2);

    orchestrator.rollback();
    assert!(orchestrator.journal_is_empty());
    assert!(!context.root_path.exists());
}

#[test]
fn failure_mid_pipeline_rolls_back_everything() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    host.fail_on("container_create");
    let mut orchestrator = Orchestrator::new(&host);

    let err = orchestrator
        .provision(&Policy::default(), &payload(&dir))
        .unwrap_err();
    assert_eq!(err.kind(), "PrimitiveFailed");

    // Journal drained, root directory gone, ephemeral principal gone.
    assert!(orchestrator.journal_is_empty());
    let root = recorded_root(&host).expect("root was created before the failure");
    assert!(!root.exists());
    let principal = root.file_name().unwrap().to_str().unwrap();
    assert!(!host.principal_exists(principal));

    // Release ran in reverse acquisition order.
    let names = host.call_names();
    let release: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| ["dir_remove_recursive", "principal_destroy"].contains(name))
        .collect();
    assert_eq!(release, vec!["dir_remove_recursive", "principal_destroy"]);
}

#[test]
fn workspace_mount_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    host.fail_on("bind_mount");
    let mut orchestrator = Orchestrator::new(&host);

    let workspace = dir.path().join("ws");
    fs::create_dir(&workspace).unwrap();
    let policy = Policy {
        workspace_path: Some(workspace),
        ..Policy::default()
    };

    let err = orchestrator.provision(&policy, &payload(&dir)).unwrap_err();
    assert_eq!(err.kind(), "PrimitiveFailed");
    assert!(orchestrator.journal_is_empty());
    assert!(!recorded_root(&host).unwrap().exists());
}

#[test]
fn missing_named_principal_is_a_policy_violation() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    let mut orchestrator = Orchestrator::new(&host);

    let policy = Policy {
        principal: Principal::Named("nosuchuser".to_string()),
        ..Policy::default()
    };

    let err = orchestrator.provision(&policy, &payload(&dir)).unwrap_err();
    assert_eq!(err.kind(), "PolicyViolation");

    // Failed before any acquisition: nothing recorded, no root directory.
    assert!(orchestrator.journal_is_empty());
    assert!(recorded_root(&host).is_none());
}

#[test]
fn named_principal_is_not_journaled() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new().with_principal("svc", 1000, 1000);
    let mut orchestrator = Orchestrator::new(&host);

    let policy = Policy {
        principal: Principal::Named("svc".to_string()),
        ..Policy::default()
    };

    let context = orchestrator.provision(&policy, &payload(&dir)).unwrap();
    assert_eq!(context.principal_name, "svc");
    assert_eq!((context.uid, context.gid), (1000, 1000));

    let journal = orchestrator.journal_handle();
    assert!(!journal
        .lock()
        .unwrap()
        .entries()
        .iter()
        .any(|entry| entry.kind() == "PrincipalCreated"));

    orchestrator.rollback();
    // An existing principal survives rollback.
    assert!(host.principal_exists("svc"));
}

#[test]
fn device_mount_failure_downgrades_to_a_warning() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    host.fail_on("overlay_mount_dev");
    let mut orchestrator = Orchestrator::new(&host);

    let context = orchestrator
        .provision(&Policy::default(), &payload(&dir))
        .unwrap();

    let journal = orchestrator.journal_handle();
    assert!(!journal
        .lock()
        .unwrap()
        .entries()
        .iter()
        .any(|entry| entry.kind() == "DevMounted"));

    orchestrator.rollback();
    assert!(!context.root_path.exists());
}

#[test]
fn rejected_accounting_rule_downgrades_per_rule() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    host.fail_on("accounting_add_rule");
    let mut orchestrator = Orchestrator::new(&host);

    let policy = Policy {
        limits: ResourceLimits {
            memory_bytes: 64 * 1024 * 1024,
            max_files: 128,
            ..ResourceLimits::default()
        },
        ..Policy::default()
    };

    let context = orchestrator.provision(&policy, &payload(&dir)).unwrap();

    let journal = orchestrator.journal_handle();
    assert!(!journal
        .lock()
        .unwrap()
        .entries()
        .iter()
        .any(|entry| entry.kind() == "AccountingRuleAdded"));

    orchestrator.rollback();
    assert!(!context.root_path.exists());
}

#[test]
fn file_rules_mount_only_readable_existing_directories() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    let mut orchestrator = Orchestrator::new(&host);

    let shared_ro = dir.path().join("shared-ro");
    let shared_rw = dir.path().join("shared-rw");
    fs::create_dir(&shared_ro).unwrap();
    fs::create_dir(&shared_rw).unwrap();
    let regular_file = dir.path().join("plain.txt");
    fs::write(&regular_file, b"x").unwrap();

    let policy = Policy {
        file_rules: vec![
            FileRule {
                path: shared_ro.clone(),
                perms: FilePerms::READ_ONLY,
            },
            FileRule {
                path: shared_rw.clone(),
                perms: FilePerms {
                    read: true,
                    write: true,
                    execute: false,
                },
            },
            // Not a directory: skipped with a warning.
            FileRule {
                path: regular_file,
                perms: FilePerms::READ_ONLY,
            },
            // Does not exist: skipped with a warning.
            FileRule {
                path: dir.path().join("missing"),
                perms: FilePerms::READ_ONLY,
            },
            // No read permission: skipped.
            FileRule {
                path: shared_ro.clone(),
                perms: FilePerms {
                    read: false,
                    write: true,
                    execute: false,
                },
            },
        ],
        ..Policy::default()
    };

    let context = orchestrator.provision(&policy, &payload(&dir)).unwrap();

    let binds: Vec<String> = host
        .calls()
        .iter()
        .filter(|call| call.starts_with("bind_mount"))
        .cloned()
        .collect();
    assert_eq!(binds.len(), 2);
    assert!(binds[0].contains("ReadOnly"));
    assert!(binds[1].contains("ReadWrite"));

    let journal = orchestrator.journal_handle();
    assert_eq!(
        journal
            .lock()
            .unwrap()
            .entries()
            .iter()
            .filter(|entry| entry.kind() == "BindMounted")
            .count(),
        2
    );

    orchestrator.rollback();
    assert!(!context.root_path.exists());
}

#[test]
fn rollback_is_idempotent_across_the_orchestrator() {
    let dir = TempDir::new().unwrap();
    let host = MockHost::new();
    let mut orchestrator = Orchestrator::new(&host);

    orchestrator
        .provision(&Policy::default(), &payload(&dir))
        .unwrap();

    orchestrator.rollback();
    let calls_after_first = host.calls().len();
    orchestrator.rollback();
    assert_eq!(host.calls().len(), calls_after_first);
    assert!(orchestrator.journal_is_empty());
}
