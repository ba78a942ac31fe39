//! Launcher: privilege check, supervised hand-off into the sandbox,
//! process image replacement.
//!
//! The parent provisions and owns the journal; the child attaches,
//! drops credentials and execs the payload. Host-side state (ephemeral
//! principal, root directory, container record) is reclaimed by the
//! parent after the payload exits, on every path.

use crate::guard;
use crate::journal::Journal;
use crate::kernel::UnixHost;
use crate::orchestrator::{IsolationContext, Orchestrator};
use crate::policy::Policy;
use crate::types::{IsolateError, Result};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, ForkResult, Pid};
use std::ffi::CString;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exit code reported when the child cannot reach or perform the exec.
const EXIT_LAUNCH_FAILURE: i32 = 1;

/// Effective super-user is required for every host primitive the
/// orchestrator provisions with. Checked before orchestration begins.
pub fn ensure_privileged() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(IsolateError::Unprivileged(
            "creating isolation contexts requires super-user privileges".to_string(),
        ));
    }
    Ok(())
}

/// Execute `target` with `args` inside a sandbox described by `policy`.
/// Returns the payload's exit code. Every provisioned resource is
/// reclaimed before this returns, success or not.
pub fn launch(policy: &Policy, target: &Path, args: &[String]) -> Result<i32> {
    ensure_privileged()?;
    guard::install()?;

    let host = UnixHost::new();
    let mut orchestrator = Orchestrator::new(&host);

    arm_emergency_rollback(orchestrator.journal_handle());
    let _exit_guard = guard::ExitGuard::new();

    let context = orchestrator.provision(policy, target)?;
    debug!(
        "sandbox ready: principal {} ({}:{}), root {}",
        context.principal_name,
        context.uid,
        context.gid,
        context.root_path.display()
    );

    let outcome = supervise(&mut orchestrator, &context, policy, args);
    orchestrator.rollback();
    guard::disarm();
    outcome
}

/// Point the guard's rollback slot at the orchestrator's journal. The
/// slot builds its own host handle; the journal stays shared.
fn arm_emergency_rollback(journal: Arc<Mutex<Journal>>) {
    guard::arm(Box::new(move || {
        let host = UnixHost::new();
        if let Ok(mut journal) = journal.try_lock() {
            journal.rollback(&host);
        }
    }));
}

fn supervise(
    orchestrator: &mut Orchestrator,
    context: &IsolationContext,
    policy: &Policy,
    args: &[String],
) -> Result<i32> {
    // SAFETY: the process is single-threaded here; the child performs
    // only attach, credential drop and exec before its image is replaced.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Rollback belongs to the supervising parent alone.
            guard::disarm();
            let err = match enter_and_exec(orchestrator, context, policy, args) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            eprintln!("isolate: {}: {}", err.kind(), err);
            std::process::exit(EXIT_LAUNCH_FAILURE);
        }
        Ok(ForkResult::Parent { child }) => wait_for_payload(child),
        Err(errno) => Err(IsolateError::primitive_errno("fork", errno)),
    }
}

/// Child side: enter the context and replace the process image with
/// the payload. Only returns on failure.
fn enter_and_exec(
    orchestrator: &mut Orchestrator,
    context: &IsolationContext,
    policy: &Policy,
    args: &[String],
) -> Result<std::convert::Infallible> {
    let environment = orchestrator.enter(context, policy)?;
    orchestrator.mark_handed_off();

    let (path, argv, envp) = exec_vectors(context, args, &environment)?;
    let errno = execve(&path, &argv, &envp).unwrap_err();
    Err(IsolateError::Launch(format!(
        "cannot execute {}: {}",
        context.payload_name, errno
    )))
}

/// Build the exec path, argument vector (argv[0] rewritten to the
/// in-container basename) and environment block.
fn exec_vectors(
    context: &IsolationContext,
    args: &[String],
    environment: &[(String, String)],
) -> Result<(CString, Vec<CString>, Vec<CString>)> {
    let nul_free = |what: &str, value: String| {
        CString::new(value)
            .map_err(|_| IsolateError::Launch(format!("{} contains a NUL byte", what)))
    };

    let path = nul_free(
        "payload path",
        context.payload_path().to_string_lossy().into_owned(),
    )?;

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(nul_free("payload name", context.payload_name.clone())?);
    for arg in args {
        argv.push(nul_free("argument", arg.clone())?);
    }

    let mut envp = Vec::with_capacity(environment.len());
    for (name, value) in environment {
        envp.push(nul_free("environment entry", format!("{}={}", name, value))?);
    }

    Ok((path, argv, envp))
}

/// Parent side: wait for the payload, converting its status to an exit
/// code. An abort signal kills the payload group and surfaces `Aborted`.
fn wait_for_payload(child: Pid) -> Result<i32> {
    loop {
        if guard::abort_requested() {
            warn!(
                "signal {} received, terminating payload",
                guard::received_signal()
            );
            let _ = kill(Pid::from_raw(-child.as_raw()), Signal::SIGKILL);
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Err(IsolateError::Aborted);
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(10)),
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(IsolateError::primitive_errno("waitpid", errno)),
        }
    }
}
