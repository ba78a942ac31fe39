//! Isolation orchestrator: builds an `IsolationContext` from a policy
//! transactionally, then yields to the launcher.
//!
//! The provisioning order is contractual — later steps depend on
//! earlier side effects, and rollback correctness depends on releasing
//! in exact reverse. Every acquisition is journaled immediately; any
//! failure before the attach point rolls the journal back and surfaces
//! a typed error, leaving no host-observable state behind.

pub mod context;

pub use context::IsolationContext;

use crate::guard;
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{
    AccountingMetric, ContainerSpec, HostPrimitives, MountMode, NetworkMode,
};
use crate::policy::{Policy, Principal};
use crate::types::{IsolateError, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Mount point of the workspace inside the sandbox.
pub const WORKSPACE_MOUNT: &str = "workspace";

/// Library search path handed to the payload unless a rule overrides it.
const LIBRARY_SEARCH_PATH_VAR: &str = "LD_LIBRARY_PATH";
const LIBRARY_SEARCH_PATH_DEFAULT: &str = "/lib:/usr/lib:/usr/local/lib";

/// Fixed subdirectory skeleton of the private root.
const ROOT_SKELETON: [&str; 11] = [
    "bin",
    "lib",
    "usr/lib",
    "usr/local/lib",
    "dev",
    "tmp",
    "libexec",
    "etc",
    "var/log",
    "var/tmp",
    "var/run",
];

/// Orchestrator lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Provisioning,
    Attached,
    Dropped,
    HandedOff,
    RolledBack,
}

/// Drives the provisioning pipeline against a host-primitive
/// implementation, recording every acquisition in the journal it owns.
pub struct Orchestrator<'h> {
    host: &'h dyn HostPrimitives,
    journal: Arc<Mutex<Journal>>,
    state: State,
}

impl<'h> Orchestrator<'h> {
    pub fn new(host: &'h dyn HostPrimitives) -> Self {
        Self {
            host,
            journal: Arc::new(Mutex::new(Journal::new())),
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Shared handle to the journal, for the exit guard's emergency
    /// slot. The journal remains logically owned by the orchestrator.
    pub fn journal_handle(&self) -> Arc<Mutex<Journal>> {
        Arc::clone(&self.journal)
    }

    /// Provision the isolated execution context for `target` under
    /// `policy` (pipeline steps up to container creation and
    /// accounting). On any failure the journal is rolled back before
    /// the error is returned.
    pub fn provision(&mut self, policy: &Policy, target: &Path) -> Result<IsolationContext> {
        self.state = State::Provisioning;
        match self.provision_inner(policy, target) {
            Ok(context) => Ok(context),
            Err(err) => {
                warn!("provisioning failed, rolling back: {}", err);
                self.rollback();
                Err(err)
            }
        }
    }

    fn provision_inner(&mut self, policy: &Policy, target: &Path) -> Result<IsolationContext> {
        policy.validate()?;

        let payload_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                IsolateError::Launch(format!(
                    "payload path has no usable file name: {}",
                    target.display()
                ))
            })?;

        // Step 1: unique invocation tag; container, principal and root
        // directory names all derive from it.
        let tag = invocation_tag();
        let unit_name = format!("isolate-{}", tag);
        let root_path = std::env::temp_dir().join(&unit_name);
        info!("provisioning sandbox {}", unit_name);

        // Step 2: principal resolution.
        self.check_abort()?;
        let (principal_name, uid, gid) = match &policy.principal {
            Principal::EphemeralAuto => {
                let (uid, gid) = self.host.principal_create_ephemeral(&unit_name)?;
                self.record(JournalEntry::PrincipalCreated(unit_name.clone()));
                (unit_name.clone(), uid, gid)
            }
            Principal::Named(name) => {
                let (uid, gid) = self.host.principal_lookup(name)?.ok_or_else(|| {
                    IsolateError::PolicyViolation(format!("principal {} does not exist", name))
                })?;
                (name.clone(), uid, gid)
            }
        };

        // Step 3: private root filesystem.
        self.check_abort()?;
        self.host.root_dir_create(&root_path)?;
        self.record(JournalEntry::RootDirCreated(root_path.clone()));
        self.build_root_skeleton(&root_path)?;
        self.install_payload(target, &root_path, &payload_name)?;
        self.write_identity_stubs(&root_path, &principal_name, uid, gid)?;

        // Step 4: workspace bind. Failure is fatal.
        self.check_abort()?;
        if let Some(workspace) = &policy.workspace_path {
            let mount_target = root_path.join(WORKSPACE_MOUNT);
            fs::create_dir_all(&mount_target)
                .map_err(|e| IsolateError::primitive("bind_mount", e))?;
            self.host
                .bind_mount(workspace, &mount_target, MountMode::ReadWrite)?;
            self.record(JournalEntry::WorkspaceMounted(mount_target));
        }

        // Step 5: device filesystem. Some hosts forbid it under nested
        // confinement; failure downgrades to a warning.
        self.check_abort()?;
        let dev_target = root_path.join("dev");
        match self.host.overlay_mount_dev(&dev_target) {
            Ok(()) => self.record(JournalEntry::DevMounted(dev_target)),
            Err(err) => warn!("device filesystem unavailable: {}", err),
        }

        // Step 6: filesystem capability materialization. Only declared
        // directory paths are exposed; the private root is default-deny
        // regardless of the fs_default_deny flag.
        self.check_abort()?;
        for rule in &policy.file_rules {
            if !rule.perms.read {
                warn!(
                    "file rule {} grants no read access, skipped",
                    rule.path.display()
                );
                continue;
            }
            if !rule.path.is_dir() {
                warn!(
                    "file rule {} is not an existing directory, skipped",
                    rule.path.display()
                );
                continue;
            }
            let relative = rule.path.strip_prefix("/").unwrap_or(&rule.path);
            let mount_target = root_path.join(relative);
            fs::create_dir_all(&mount_target)
                .map_err(|e| IsolateError::primitive("bind_mount", e))?;
            let mode = if rule.perms.write {
                MountMode::ReadWrite
            } else {
                MountMode::ReadOnly
            };
            self.host.bind_mount(&rule.path, &mount_target, mode)?;
            self.record(JournalEntry::BindMounted(mount_target));
        }

        // Step 7: confinement container.
        self.check_abort()?;
        let spec = ContainerSpec {
            name: unit_name.clone(),
            root: root_path.clone(),
            network_mode: NetworkMode::InheritHost,
            ipc_allowed: false,
            raw_sockets_allowed: false,
            af_sockets_allowed: true,
        };
        let container = self.host.container_create(&spec)?;
        self.record(JournalEntry::ContainerCreated(container.clone()));

        // Step 8: resource accounting. A rejected rule is a warning,
        // not an abort; only installed rules are recorded.
        self.check_abort()?;
        let limits = &policy.limits;
        let rules = [
            (AccountingMetric::Memory, limits.memory_bytes),
            (AccountingMetric::Processes, limits.max_processes as u64),
            (AccountingMetric::OpenFiles, limits.max_files as u64),
            (AccountingMetric::CpuPercent, limits.max_cpu_percent as u64),
        ];
        for (metric, limit) in rules {
            if limit == 0 {
                continue;
            }
            match self.host.accounting_add_rule(&unit_name, metric, limit) {
                Ok(()) => self.record(JournalEntry::AccountingRuleAdded {
                    container: unit_name.clone(),
                    metric,
                }),
                Err(err) => warn!(
                    "accounting rule {}={} rejected by the host: {}",
                    metric.as_str(),
                    limit,
                    err
                ),
            }
        }

        // Step 9: network rules are retained on the policy; the host
        // primitive offers no per-rule firewall today.
        if !policy.network_rules.is_empty() {
            debug!(
                "retaining {} network rules without firewall enforcement",
                policy.network_rules.len()
            );
        }

        self.check_abort()?;
        Ok(IsolationContext {
            tag,
            principal_name,
            uid,
            gid,
            root_path,
            container,
            payload_name,
        })
    }

    /// Enter the provisioned context: attach to the container and drop
    /// credentials (pipeline steps 10–11, the point of no return), then
    /// compose the payload environment (step 12). Runs in the process
    /// that will exec the payload.
    pub fn enter(&mut self, context: &IsolationContext, policy: &Policy) -> Result<Vec<(String, String)>> {
        self.host.container_attach(&context.container)?;
        self.state = State::Attached;

        self.host.credential_switch(context.uid, context.gid)?;
        self.state = State::Dropped;

        Ok(build_environment(policy, &context.principal_name))
    }

    /// Final transition before process image replacement.
    pub fn mark_handed_off(&mut self) {
        self.state = State::HandedOff;
    }

    /// Release everything recorded so far, in reverse. Idempotent.
    pub fn rollback(&mut self) {
        self.journal.lock().unwrap().rollback(self.host);
        self.state = State::RolledBack;
    }

    /// True once every journaled acquisition has been released.
    pub fn journal_is_empty(&self) -> bool {
        self.journal.lock().unwrap().is_empty()
    }

    fn record(&mut self, entry: JournalEntry) {
        self.journal.lock().unwrap().record(entry);
    }

    fn check_abort(&self) -> Result<()> {
        if guard::abort_requested() {
            return Err(IsolateError::Aborted);
        }
        Ok(())
    }

    fn build_root_skeleton(&self, root: &Path) -> Result<()> {
        for dir in ROOT_SKELETON {
            fs::create_dir_all(root.join(dir))
                .map_err(|e| IsolateError::primitive("root_dir_create", e))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root.join("tmp"), fs::Permissions::from_mode(0o1777))
                .map_err(|e| IsolateError::primitive("root_dir_create", e))?;
        }
        Ok(())
    }

    fn install_payload(&self, target: &Path, root: &Path, payload_name: &str) -> Result<()> {
        let bytes = fs::read(target).map_err(|e| IsolateError::primitive("payload_copy", e))?;
        self.host.file_write(&root.join(payload_name), &bytes, 0o755)
    }

    /// Minimal in-sandbox identity database: exactly the super-user and
    /// the resolved principal, no shadow file.
    fn write_identity_stubs(
        &self,
        root: &Path,
        principal: &str,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let passwd = format!(
            "root:x:0:0:root:/root:/usr/sbin/nologin\n{}:x:{}:{}:isolate principal:/tmp:/usr/sbin/nologin\n",
            principal, uid, gid
        );
        let group = format!("root:x:0:\n{}:x:{}:\n", principal, gid);
        self.host
            .file_write(&root.join("etc/passwd"), passwd.as_bytes(), 0o644)?;
        self.host
            .file_write(&root.join("etc/group"), group.as_bytes(), 0o644)
    }
}

/// Derive the unique invocation tag from the process id and a random
/// discriminator, so concurrent invocations never collide.
fn invocation_tag() -> String {
    let discriminator = Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &discriminator[..8])
}

/// Compose the payload's starting environment: the caller's environment
/// unless the policy clears it, the injected rules, and the minimal
/// default triplet wherever no rule overrides it.
pub fn build_environment(policy: &Policy, principal: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = if policy.env_clear {
        Vec::new()
    } else {
        std::env::vars().collect()
    };

    let mut set = |name: &str, value: &str| {
        match env.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = value.to_string(),
            None => env.push((name.to_string(), value.to_string())),
        }
    };

    for (name, value) in &policy.env_rules {
        set(name, value);
    }

    let defaults = [
        ("USER", principal),
        ("HOME", "/tmp"),
        (LIBRARY_SEARCH_PATH_VAR, LIBRARY_SEARCH_PATH_DEFAULT),
    ];
    for (name, value) in defaults {
        if !policy.env_rules.iter().any(|(rule, _)| rule == name) {
            set(name, value);
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::Policy;

    #[test]
    fn tags_are_unique() {
        let a = invocation_tag();
        let b = invocation_tag();
        assert_ne!(a, b);
        assert!(a.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn cleared_environment_is_exactly_rules_plus_defaults() {
        let policy = Policy {
            env_clear: true,
            env_rules: vec![("APP_MODE".to_string(), "test".to_string())],
            ..Policy::default()
        };
        let mut env = build_environment(&policy, "isolate-1-abc");
        env.sort();

        let mut expected = vec![
            ("APP_MODE".to_string(), "test".to_string()),
            ("USER".to_string(), "isolate-1-abc".to_string()),
            ("HOME".to_string(), "/tmp".to_string()),
            (
                LIBRARY_SEARCH_PATH_VAR.to_string(),
                LIBRARY_SEARCH_PATH_DEFAULT.to_string(),
            ),
        ];
        expected.sort();
        assert_eq!(env, expected);
    }

    #[test]
    fn env_rule_overrides_default_triplet() {
        let policy = Policy {
            env_clear: true,
            env_rules: vec![("HOME".to_string(), "/data".to_string())],
            ..Policy::default()
        };
        let env = build_environment(&policy, "svc");
        let home = env.iter().find(|(name, _)| name == "HOME").unwrap();
        assert_eq!(home.1, "/data");
    }

    #[test]
    fn inherited_environment_survives_without_clear() {
        std::env::set_var("ISOLATE_TEST_MARKER", "kept");
        let env = build_environment(&Policy::default(), "svc");
        assert!(env
            .iter()
            .any(|(name, value)| name == "ISOLATE_TEST_MARKER" && value == "kept"));
        std::env::remove_var("ISOLATE_TEST_MARKER");
    }
}
