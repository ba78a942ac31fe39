/// Real host implementation of the primitive surface.
///
/// Principals are direct `/etc/passwd` and `/etc/group` edits, mounts
/// go through `libc::mount`, the confinement container is a mount+IPC
/// namespace set entered with `unshare` and `chroot`, and accounting
/// maps onto cgroup-v1 controller files plus an `RLIMIT_NOFILE` rule
/// applied at attach time. A runtime record per container lives under
/// `/var/run/isolate/`.
use crate::kernel::{
    AccountingMetric, ContainerId, ContainerSpec, HostPrimitives, MountMode, NetworkMode,
};
use crate::types::{IsolateError, Result};
use log::{debug, warn};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const PASSWD_FILE: &str = "/etc/passwd";
const GROUP_FILE: &str = "/etc/group";
const NOLOGIN_SHELL: &str = "/usr/sbin/nologin";
const RUN_DIR: &str = "/var/run/isolate";
const CGROUP_BASE: &str = "/sys/fs/cgroup";
const CGROUP_CONTROLLERS: [&str; 3] = ["memory", "pids", "cpu"];

/// First and last uid/gid usable for ephemeral principals. Allocation
/// scans downward from the top of the range.
const EPHEMERAL_ID_MIN: u32 = 59000;
const EPHEMERAL_ID_MAX: u32 = 59999;

/// Host primitives backed by the running kernel.
#[derive(Debug, Default)]
pub struct UnixHost;

impl UnixHost {
    pub fn new() -> Self {
        Self
    }

    fn record_path(name: &str) -> PathBuf {
        Path::new(RUN_DIR).join(format!("{}.container", name))
    }

    fn read_record(name: &str) -> Result<Vec<(String, String)>> {
        let content = fs::read_to_string(Self::record_path(name))
            .map_err(|e| IsolateError::primitive("container_attach", e))?;
        Ok(content
            .lines()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect())
    }

    fn append_record(name: &str, key: &str, value: &str) -> io::Result<()> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(Self::record_path(name))?;
        writeln!(file, "{}={}", key, value)
    }

    fn cgroup_dir(controller: &str, container: &str) -> PathBuf {
        Path::new(CGROUP_BASE).join(controller).join(container)
    }
}

fn path_cstr(primitive: &'static str, path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        IsolateError::primitive(
            primitive,
            io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"),
        )
    })
}

fn mount_call(
    primitive: &'static str,
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> Result<()> {
    let source_c = CString::new(source.unwrap_or("none")).expect("static mount source");
    let target_c = path_cstr(primitive, target)?;
    let fstype_c = fstype.map(|t| CString::new(t).expect("static fstype"));
    let data_c = data.map(|d| CString::new(d).expect("static mount data"));

    // SAFETY: all pointers come from live CStrings above.
    let rc = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |c| c.as_ptr() as *const libc::c_void),
        )
    };
    if rc != 0 {
        return Err(IsolateError::primitive(
            primitive,
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Mount points from a /proc/self/mounts snapshot that sit below `root`,
/// deepest first so they unmount cleanly.
fn mounts_below(mounts: &str, root: &Path) -> Vec<PathBuf> {
    let mut below: Vec<PathBuf> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(PathBuf::from)
        .filter(|target| target.starts_with(root))
        .collect();
    below.sort_by_key(|target| std::cmp::Reverse(target.as_os_str().len()));
    below
}

fn parse_passwd_line(line: &str) -> Option<(&str, u32, u32)> {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let _password = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    Some((name, uid, gid))
}

/// Rewrite an /etc database file dropping every line whose first field
/// is `name`. Best-effort; failures are warnings.
fn strip_database_entry(file: &str, name: &str) {
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(err) => {
            warn!("cannot read {} while removing {}: {}", file, name, err);
            return;
        }
    };
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| line.split(':').next() != Some(name))
        .collect();
    let mut rewritten = kept.join("\n");
    if !rewritten.is_empty() {
        rewritten.push('\n');
    }
    if let Err(err) = fs::write(file, rewritten) {
        warn!("cannot rewrite {} while removing {}: {}", file, name, err);
    }
}

impl HostPrimitives for UnixHost {
    fn principal_lookup(&self, name: &str) -> Result<Option<(u32, u32)>> {
        let content = fs::read_to_string(PASSWD_FILE)
            .map_err(|e| IsolateError::primitive("principal_lookup", e))?;
        for line in content.lines() {
            if let Some((entry, uid, gid)) = parse_passwd_line(line) {
                if entry == name {
                    return Ok(Some((uid, gid)));
                }
            }
        }
        Ok(None)
    }

    fn principal_create_ephemeral(&self, name: &str) -> Result<(u32, u32)> {
        if let Some(ids) = self.principal_lookup(name)? {
            debug!("principal {} already exists, reusing", name);
            return Ok(ids);
        }

        let passwd = fs::read_to_string(PASSWD_FILE)
            .map_err(|e| IsolateError::primitive("principal_create_ephemeral", e))?;
        let used: Vec<u32> = passwd
            .lines()
            .filter_map(parse_passwd_line)
            .flat_map(|(_, uid, gid)| [uid, gid])
            .collect();

        let id = (EPHEMERAL_ID_MIN..=EPHEMERAL_ID_MAX)
            .rev()
            .find(|id| !used.contains(id))
            .ok_or_else(|| {
                IsolateError::primitive(
                    "principal_create_ephemeral",
                    io::Error::new(io::ErrorKind::Other, "no free id in the ephemeral range"),
                )
            })?;

        use std::io::Write;
        let append = |file: &str, line: String| -> io::Result<()> {
            let mut handle = fs::OpenOptions::new().append(true).open(file)?;
            writeln!(handle, "{}", line)
        };
        append(
            PASSWD_FILE,
            format!("{}:x:{}:{}:isolate ephemeral:/tmp:{}", name, id, id, NOLOGIN_SHELL),
        )
        .map_err(|e| IsolateError::primitive("principal_create_ephemeral", e))?;
        append(GROUP_FILE, format!("{}:x:{}:", name, id))
            .map_err(|e| IsolateError::primitive("principal_create_ephemeral", e))?;

        debug!("created ephemeral principal {} ({}:{})", name, id, id);
        Ok((id, id))
    }

    fn principal_destroy(&self, name: &str) {
        // Never touch entries outside the ephemeral id range.
        match self.principal_lookup(name) {
            Ok(Some((uid, _))) if (EPHEMERAL_ID_MIN..=EPHEMERAL_ID_MAX).contains(&uid) => {
                strip_database_entry(PASSWD_FILE, name);
                strip_database_entry(GROUP_FILE, name);
                debug!("removed ephemeral principal {}", name);
            }
            Ok(Some(_)) => warn!("refusing to remove non-ephemeral principal {}", name),
            Ok(None) => {}
            Err(err) => warn!("principal lookup failed during destroy of {}: {}", name, err),
        }
    }

    fn root_dir_create(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(IsolateError::primitive("root_dir_create", err)),
        }
        fs::create_dir_all(path).map_err(|e| IsolateError::primitive("root_dir_create", e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| IsolateError::primitive("root_dir_create", e))
    }

    fn bind_mount(&self, source: &Path, target: &Path, mode: MountMode) -> Result<()> {
        let source_c = path_cstr("bind_mount", source)?;
        let target_c = path_cstr("bind_mount", target)?;

        let flags = libc::MS_BIND | libc::MS_NOSUID | libc::MS_NODEV;
        // SAFETY: pointers come from live CStrings above.
        let rc = unsafe {
            libc::mount(
                source_c.as_ptr(),
                target_c.as_ptr(),
                std::ptr::null(),
                flags,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(IsolateError::primitive(
                "bind_mount",
                io::Error::last_os_error(),
            ));
        }

        if mode == MountMode::ReadOnly {
            // A bind mount ignores MS_RDONLY on creation; it takes a remount pass.
            let remount_flags =
                flags | libc::MS_REMOUNT | libc::MS_RDONLY;
            // SAFETY: same pointers as above.
            let rc = unsafe {
                libc::mount(
                    source_c.as_ptr(),
                    target_c.as_ptr(),
                    std::ptr::null(),
                    remount_flags,
                    std::ptr::null(),
                )
            };
            if rc != 0 {
                let err = io::Error::last_os_error();
                self.unmount(target);
                return Err(IsolateError::primitive("bind_mount", err));
            }
        }

        debug!(
            "bind mounted {} -> {} ({:?})",
            source.display(),
            target.display(),
            mode
        );
        Ok(())
    }

    fn overlay_mount_dev(&self, target: &Path) -> Result<()> {
        mount_call(
            "overlay_mount_dev",
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NOATIME,
            Some("size=64k,mode=755"),
        )?;

        let devices = [("null", 1, 3), ("zero", 1, 5), ("random", 1, 8), ("urandom", 1, 9)];
        for (name, major, minor) in devices {
            let device_path = target.join(name);
            let path_c = path_cstr("overlay_mount_dev", &device_path)?;
            // SAFETY: path_c is a live CString; mknod has no other preconditions.
            let rc = unsafe {
                libc::mknod(
                    path_c.as_ptr(),
                    libc::S_IFCHR | 0o666,
                    libc::makedev(major, minor),
                )
            };
            if rc != 0 {
                warn!(
                    "cannot create device node {}: {}",
                    device_path.display(),
                    io::Error::last_os_error()
                );
            }
        }

        let standard_streams = [("stdin", "fd/0"), ("stdout", "fd/1"), ("stderr", "fd/2")];
        let _ = std::os::unix::fs::symlink("/proc/self/fd", target.join("fd"));
        for (name, link) in standard_streams {
            let _ = std::os::unix::fs::symlink(link, target.join(name));
        }

        debug!("mounted device filesystem at {}", target.display());
        Ok(())
    }

    fn unmount(&self, target: &Path) {
        let target_c = match path_cstr("unmount", target) {
            Ok(c) => c,
            Err(_) => return,
        };
        // SAFETY: target_c is a live CString.
        let rc = unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
        if rc != 0 {
            debug!(
                "unmount of {} failed: {}",
                target.display(),
                io::Error::last_os_error()
            );
        }
    }

    fn dir_remove_recursive(&self, path: &Path) {
        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("cannot remove {}: {}", path.display(), err),
        }
    }

    fn container_create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        if spec.name.is_empty() || spec.name.contains(['/', '\0']) {
            return Err(IsolateError::primitive(
                "container_create",
                io::Error::new(io::ErrorKind::InvalidInput, "invalid container name"),
            ));
        }

        fs::create_dir_all(RUN_DIR)
            .map_err(|e| IsolateError::primitive("container_create", e))?;

        let record = Self::record_path(&spec.name);
        if record.exists() {
            return Err(IsolateError::primitive(
                "container_create",
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("container {} already registered", spec.name),
                ),
            ));
        }

        let NetworkMode::InheritHost = spec.network_mode;
        let contents = format!(
            "root={}\nipc={}\nraw_sockets={}\naf_sockets={}\nnetwork=inherit\n",
            spec.root.display(),
            if spec.ipc_allowed { "allow" } else { "deny" },
            if spec.raw_sockets_allowed { "allow" } else { "deny" },
            if spec.af_sockets_allowed { "allow" } else { "deny" },
        );
        fs::write(&record, contents)
            .map_err(|e| IsolateError::primitive("container_create", e))?;

        debug!("registered container {} at {}", spec.name, spec.root.display());
        Ok(ContainerId::new(spec.name.clone(), spec.root.clone()))
    }

    fn container_attach(&self, id: &ContainerId) -> Result<()> {
        let record = Self::read_record(id.name())?;
        let ipc_denied = record
            .iter()
            .any(|(key, value)| key == "ipc" && value == "deny");
        let nofile: Option<u64> = record
            .iter()
            .find(|(key, _)| key == "nofile")
            .and_then(|(_, value)| value.parse().ok());

        let mut flags = nix::sched::CloneFlags::CLONE_NEWNS;
        if ipc_denied {
            flags |= nix::sched::CloneFlags::CLONE_NEWIPC;
        }
        nix::sched::unshare(flags)
            .map_err(|e| IsolateError::primitive_errno("container_attach", e))?;

        // Keep mount changes inside the new namespace.
        mount_call(
            "container_attach",
            None,
            Path::new("/"),
            None,
            libc::MS_REC | libc::MS_PRIVATE,
            None,
        )?;

        // Join accounting groups before the root switch hides them.
        let pid = std::process::id().to_string();
        for controller in CGROUP_CONTROLLERS {
            let procs = Self::cgroup_dir(controller, id.name()).join("cgroup.procs");
            if procs.exists() {
                if let Err(err) = fs::write(&procs, &pid) {
                    warn!("cannot join {}: {}", procs.display(), err);
                }
            }
        }

        if let Some(limit) = nofile {
            let rlim = libc::rlimit {
                rlim_cur: limit as libc::rlim_t,
                rlim_max: limit as libc::rlim_t,
            };
            // SAFETY: rlim is a valid rlimit value on the stack.
            let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
            if rc != 0 {
                warn!(
                    "cannot apply open-files limit {}: {}",
                    limit,
                    io::Error::last_os_error()
                );
            }
        }

        let root_c = path_cstr("container_attach", id.root())?;
        // SAFETY: root_c is a live CString.
        let rc = unsafe { libc::chroot(root_c.as_ptr()) };
        if rc != 0 {
            return Err(IsolateError::primitive(
                "container_attach",
                io::Error::last_os_error(),
            ));
        }
        std::env::set_current_dir("/")
            .map_err(|e| IsolateError::primitive("container_attach", e))?;

        debug!("attached to container {}", id.name());
        Ok(())
    }

    fn container_destroy(&self, id: &ContainerId) {
        if let Ok(mounts) = fs::read_to_string("/proc/self/mounts") {
            for target in mounts_below(&mounts, id.root()) {
                self.unmount(&target);
            }
        }
        for controller in CGROUP_CONTROLLERS {
            let dir = Self::cgroup_dir(controller, id.name());
            if dir.exists() {
                if let Err(err) = fs::remove_dir(&dir) {
                    warn!("cannot remove accounting group {}: {}", dir.display(), err);
                }
            }
        }
        if let Err(err) = fs::remove_file(Self::record_path(id.name())) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("cannot remove container record for {}: {}", id.name(), err);
            }
        }
        debug!("destroyed container {}", id.name());
    }

    fn accounting_add_rule(
        &self,
        container: &str,
        metric: AccountingMetric,
        limit: u64,
    ) -> Result<()> {
        let write_limit = |controller: &str, file: &str, value: String| -> Result<()> {
            let dir = Self::cgroup_dir(controller, container);
            fs::create_dir_all(&dir)
                .map_err(|e| IsolateError::primitive("accounting_add_rule", e))?;
            fs::write(dir.join(file), value)
                .map_err(|e| IsolateError::primitive("accounting_add_rule", e))
        };

        match metric {
            AccountingMetric::Memory => {
                write_limit("memory", "memory.limit_in_bytes", limit.to_string())?;
            }
            AccountingMetric::Processes => {
                write_limit("pids", "pids.max", limit.to_string())?;
            }
            AccountingMetric::CpuPercent => {
                write_limit("cpu", "cpu.cfs_period_us", "100000".to_string())?;
                write_limit("cpu", "cpu.cfs_quota_us", (limit * 1000).to_string())?;
            }
            AccountingMetric::OpenFiles => {
                // No cgroup controller covers descriptors; the rule is
                // applied as RLIMIT_NOFILE when the container is entered.
                Self::append_record(container, "nofile", &limit.to_string())
                    .map_err(|e| IsolateError::primitive("accounting_add_rule", e))?;
            }
        }

        debug!(
            "accounting rule {}={} installed for {}",
            metric.as_str(),
            limit,
            container
        );
        Ok(())
    }

    fn credential_switch(&self, uid: u32, gid: u32) -> Result<()> {
        // SAFETY: reading the effective gid has no preconditions.
        let saved_gid = unsafe { libc::getegid() };

        // SAFETY: an empty supplementary group list is always valid.
        let rc = unsafe { libc::setgroups(0, std::ptr::null()) };
        if rc != 0 {
            return Err(IsolateError::primitive(
                "credential_switch",
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: setresgid atomically sets real, effective and saved gids.
        let rc = unsafe { libc::setresgid(gid, gid, gid) };
        if rc != 0 {
            return Err(IsolateError::primitive(
                "credential_switch",
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: setresuid atomically sets real, effective and saved uids.
        let rc = unsafe { libc::setresuid(uid, uid, uid) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Undo the gid change so the caller observes no split state.
            // SAFETY: as above.
            let _ = unsafe { libc::setresgid(saved_gid, saved_gid, saved_gid) };
            return Err(IsolateError::primitive("credential_switch", err));
        }

        let (real_uid, effective_uid) = (nix::unistd::getuid(), nix::unistd::geteuid());
        let (real_gid, effective_gid) = (nix::unistd::getgid(), nix::unistd::getegid());
        if real_uid.as_raw() != uid
            || effective_uid.as_raw() != uid
            || real_gid.as_raw() != gid
            || effective_gid.as_raw() != gid
        {
            return Err(IsolateError::primitive(
                "credential_switch",
                io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "verification failed: real={}:{} effective={}:{} wanted {}:{}",
                        real_uid, real_gid, effective_uid, effective_gid, uid, gid
                    ),
                ),
            ));
        }

        debug!("switched credentials to {}:{}", uid, gid);
        Ok(())
    }

    fn file_write(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
        fs::write(path, bytes).map_err(|e| IsolateError::primitive("file_write", e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| IsolateError::primitive("file_write", e))
    }
}
