/// Recording host for pipeline tests.
///
/// Every primitive appends a call record; filesystem-shaped operations
/// (root directory, file writes, recursive removal) act on the real
/// filesystem so tests can point the orchestrator at a temp directory
/// and inspect the resulting layout. Any single operation can be
/// scripted to fail, which is how rollback paths are exercised.
use crate::kernel::{
    AccountingMetric, ContainerId, ContainerSpec, HostPrimitives, MountMode,
};
use crate::types::{IsolateError, Result};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

/// Default ids handed out for ephemeral principals.
const MOCK_EPHEMERAL_ID: u32 = 59999;

#[derive(Debug, Default)]
pub struct MockHost {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<&'static str>>,
    principals: Mutex<HashMap<String, (u32, u32)>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing named principal for `principal_lookup`.
    pub fn with_principal(self, name: &str, uid: u32, gid: u32) -> Self {
        self.principals
            .lock()
            .unwrap()
            .insert(name.to_string(), (uid, gid));
        self
    }

    /// Make every subsequent call to the named primitive fail.
    pub fn fail_on(&self, primitive: &'static str) {
        *self.fail_on.lock().unwrap() = Some(primitive);
    }

    /// Snapshot of the recorded call log, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the recorded calls, without arguments.
    pub fn call_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| call.split('(').next().unwrap_or(call).to_string())
            .collect()
    }

    pub fn principal_exists(&self, name: &str) -> bool {
        self.principals.lock().unwrap().contains_key(name)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, primitive: &'static str) -> Result<()> {
        if *self.fail_on.lock().unwrap() == Some(primitive) {
            return Err(IsolateError::primitive(
                primitive,
                io::Error::new(io::ErrorKind::Other, "injected failure"),
            ));
        }
        Ok(())
    }
}

impl HostPrimitives for MockHost {
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>> {
        self.check("principal_lookup")?;
        self.record(format!("principal_lookup({})", name));
        Ok(self.principals.lock().unwrap().get(name).copied())
    }

    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32)> {
        self.check("principal_create_ephemeral")?;
        self.record(format!("principal_create_ephemeral({})", name));
        let mut principals = self.principals.lock().unwrap();
        let ids = *principals
            .entry(name.to_string())
            .or_insert((MOCK_EPHEMERAL_ID, MOCK_EPHEMERAL_ID));
        Ok(ids)
    }

    fn principal_destroy(&self, name: &str) {
        self.record(format!("principal_destroy({})", name));
        self.principals.lock().unwrap().remove(name);
    }

    fn root_dir_create(&self, path: &Path) -> Result<()> {
        self.check("root_dir_create")?;
        self.record(format!("root_dir_create({})", path.display()));
        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(IsolateError::primitive("root_dir_create", err)),
        }
        fs::create_dir_all(path).map_err(|e| IsolateError::primitive("root_dir_create", e))
    }

    fn bind_mount(&self, source: &Path, target: &Path, mode: MountMode) -> Result<()> {
        self.check("bind_mount")?;
        self.record(format!(
            "bind_mount({} -> {}, {:?})",
            source.display(),
            target.display(),
            mode
        ));
        Ok(())
    }

    fn overlay_mount_dev(&self, target: &Path) -> Result<()> {
        self.check("overlay_mount_dev")?;
        self.record(format!("overlay_mount_dev({})", target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) {
        self.record(format!("unmount({})", target.display()));
    }

    fn dir_remove_recursive(&self, path: &Path) {
        self.record(format!("dir_remove_recursive({})", path.display()));
        let _ = fs::remove_dir_all(path);
    }

    fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.check("container_create")?;
        self.record(format!(
            "container_create({}, root={})",
            spec.name,
            spec.root.display()
        ));
        Ok(ContainerId::new(spec.name.clone(), spec.root.clone()))
    }

    fn container_attach(&self, id: &ContainerId) -> Result<()> {
        self.check("container_attach")?;
        self.record(format!("container_attach({})", id.name()));
        Ok(())
    }

    fn container_destroy(&self, id: &ContainerId) {
        self.record(format!("container_destroy({})", id.name()));
    }

    fn accounting_add_rule(
        &self,
        container: &str,
        metric: AccountingMetric,
        limit: u64,
    ) -> Result<()> {
        self.check("accounting_add_rule")?;
        self.record(format!(
            "accounting_add_rule({}, {}, {})",
            container,
            metric.as_str(),
            limit
        ));
        Ok(())
    }

    fn credential_switch(&self, uid: u32, gid: u32) -> Result<()> {
        self.check("credential_switch")?;
        self.record(format!("credential_switch({}:{})", uid, gid));
        Ok(())
    }

    fn file_write(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
        self.check("file_write")?;
        self.record(format!("file_write({}, {:o})", path.display(), mode));
        fs::write(path, bytes).map_err(|e| IsolateError::primitive("file_write", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| IsolateError::primitive("file_write", e))?;
        }
        Ok(())
    }
}
