//! Linux sandbox hardening applied to the thread that spawns the runner
//! child process, so only the child (and its descendants) inherit the
//! restrictions -- the orchestrator process itself is left untouched.

#[cfg(target_os = "linux")]
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::path::Path;
#[cfg(target_os = "linux")]
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use landlock::ABI;
#[cfg(target_os = "linux")]
use landlock::Access;
#[cfg(target_os = "linux")]
use landlock::AccessFs;
#[cfg(target_os = "linux")]
use landlock::CompatLevel;
#[cfg(target_os = "linux")]
use landlock::Compatible;
#[cfg(target_os = "linux")]
use landlock::Ruleset;
#[cfg(target_os = "linux")]
use landlock::RulesetAttr;
#[cfg(target_os = "linux")]
use landlock::RulesetCreatedAttr;
#[cfg(target_os = "linux")]
use seccompiler::BpfProgram;
#[cfg(target_os = "linux")]
use seccompiler::SeccompAction;
#[cfg(target_os = "linux")]
use seccompiler::SeccompCmpArgLen;
#[cfg(target_os = "linux")]
use seccompiler::SeccompCmpOp;
#[cfg(target_os = "linux")]
use seccompiler::SeccompCondition;
#[cfg(target_os = "linux")]
use seccompiler::SeccompFilter;
#[cfg(target_os = "linux")]
use seccompiler::SeccompRule;
#[cfg(target_os = "linux")]
use seccompiler::TargetArch;
#[cfg(target_os = "linux")]
use seccompiler::apply_filter;

#[cfg(target_os = "linux")]
use crate::error::Result;
#[cfg(target_os = "linux")]
use crate::error::SandboxErr;

/// Non-root identity the sandboxed thread drops into before the runner
/// execs, matching the non-root convention already enforced for cluster-backed
/// runs (`exec::cluster::JobSpecBuilder::job_spec`'s `SecurityContext`).
#[cfg(target_os = "linux")]
const SANDBOX_UID: libc::uid_t = 65532;
#[cfg(target_os = "linux")]
const SANDBOX_GID: libc::gid_t = 65532;

/// Apply the full hardening envelope for a runner invocation: the dataset
/// directory readable, one scratch directory writable, nothing else, no
/// outbound network sockets, bounded memory/CPU/process count, and a
/// non-root, capability-free identity. Must be called on the thread that
/// will `exec`/spawn the runner child -- it cannot be undone within the
/// calling process.
#[cfg(target_os = "linux")]
pub fn apply_to_current_thread(
    readable_root: &Path,
    writable_root: &Path,
    memory_limit_bytes: u64,
    cpu_limit_seconds: u64,
    max_processes: u64,
) -> Result<()> {
    install_resource_limits(memory_limit_bytes, cpu_limit_seconds, max_processes)?;
    drop_root_privileges()?;
    install_network_seccomp_filter()?;
    install_filesystem_landlock_rules(readable_root, writable_root)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn apply_to_current_thread(
    _readable_root: &std::path::Path,
    _writable_root: &std::path::Path,
    _memory_limit_bytes: u64,
    _cpu_limit_seconds: u64,
    _max_processes: u64,
) -> crate::error::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn install_resource_limits(memory_limit_bytes: u64, cpu_limit_seconds: u64, max_processes: u64) -> Result<()> {
    set_rlimit(libc::RLIMIT_AS, memory_limit_bytes)?;
    set_rlimit(libc::RLIMIT_CPU, cpu_limit_seconds)?;
    set_rlimit(libc::RLIMIT_NPROC, max_processes)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> std::result::Result<(), SandboxErr> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // Safety: `rlim` is a fully-initialized `rlimit` and lives for the call.
    let rc = unsafe { libc::setrlimit(resource, &rlim) };
    if rc != 0 {
        return Err(SandboxErr::PrivilegeSetup(format!(
            "setrlimit({resource}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Drops from root to a fixed non-root, capability-free identity. A no-op if
/// already running as non-root: such a process lacks `CAP_SETUID`/
/// `CAP_SETGID` to become an arbitrary other identity, and it already
/// satisfies the non-root requirement.
///
/// The kernel clears the effective (and, absent `SECBIT_KEEP_CAPS`, the
/// permitted) capability set whenever a process's effective UID moves away
/// from 0 -- this one `setresuid` call is what drops every capability,
/// without a separate `capset`.
#[cfg(target_os = "linux")]
fn drop_root_privileges() -> std::result::Result<(), SandboxErr> {
    // Safety: getuid takes no arguments and never fails.
    if unsafe { libc::getuid() } != 0 {
        return Ok(());
    }

    // Safety: fixed, valid gid; group must drop before the user id or the
    // process loses the privilege needed to change it.
    if unsafe { libc::setresgid(SANDBOX_GID, SANDBOX_GID, SANDBOX_GID) } != 0 {
        return Err(SandboxErr::PrivilegeSetup(format!(
            "setresgid failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    // Safety: fixed, valid uid.
    if unsafe { libc::setresuid(SANDBOX_UID, SANDBOX_UID, SANDBOX_UID) } != 0 {
        return Err(SandboxErr::PrivilegeSetup(format!(
            "setresuid failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn install_filesystem_landlock_rules(
    readable_root: &Path,
    writable_root: &Path,
) -> std::result::Result<(), SandboxErr> {
    let abi = ABI::V5;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);

    let readable: Vec<PathBuf> = vec![readable_root.to_path_buf()];
    let writable: Vec<PathBuf> = vec![writable_root.to_path_buf()];

    let ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)?
        .create()?
        .add_rules(landlock::path_beneath_rules(&readable, access_ro))?
        .add_rules(landlock::path_beneath_rules(&writable, access_rw))?
        .set_no_new_privs(true);

    let status = ruleset.restrict_self()?;

    if status.ruleset == landlock::RulesetStatus::NotEnforced {
        return Err(SandboxErr::LandlockRestrict);
    }

    Ok(())
}

/// Deny every syscall that could establish or use an outbound network
/// socket, while leaving local (AF_UNIX) sockets available since they carry
/// no network egress.
#[cfg(target_os = "linux")]
fn install_network_seccomp_filter() -> std::result::Result<(), SandboxErr> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    let mut deny_syscall = |nr: i64| {
        rules.insert(nr, vec![]);
    };

    deny_syscall(libc::SYS_connect);
    deny_syscall(libc::SYS_accept);
    deny_syscall(libc::SYS_accept4);
    deny_syscall(libc::SYS_bind);
    deny_syscall(libc::SYS_listen);
    deny_syscall(libc::SYS_getpeername);
    deny_syscall(libc::SYS_getsockname);
    deny_syscall(libc::SYS_shutdown);
    deny_syscall(libc::SYS_sendto);
    deny_syscall(libc::SYS_sendmsg);
    deny_syscall(libc::SYS_sendmmsg);
    deny_syscall(libc::SYS_recvfrom);
    deny_syscall(libc::SYS_recvmsg);
    deny_syscall(libc::SYS_recvmmsg);
    deny_syscall(libc::SYS_getsockopt);
    deny_syscall(libc::SYS_setsockopt);

    let unix_only_rule = SeccompRule::new(vec![SeccompCondition::new(
        0,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::Eq,
        libc::AF_UNIX as u64,
    )?])?;
    rules.insert(libc::SYS_socket, vec![unix_only_rule]);
    rules.insert(libc::SYS_socketpair, vec![]);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        if cfg!(target_arch = "x86_64") {
            TargetArch::x86_64
        } else if cfg!(target_arch = "aarch64") {
            TargetArch::aarch64
        } else {
            unimplemented!("unsupported architecture for seccomp filter")
        },
    )?;

    let prog: BpfProgram = filter.try_into()?;
    apply_filter(&prog)?;

    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::process::Command;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn sandboxed_thread_cannot_write_outside_scratch() {
        let data_dir = TempDir::new().unwrap();
        let scratch_dir = TempDir::new().unwrap();
        let data_path = data_dir.path().to_path_buf();
        let scratch_path = scratch_dir.path().to_path_buf();
        let _ready = Arc::new(Notify::new());

        let outcome = tokio::task::spawn_blocking(move || {
            apply_to_current_thread(&data_path, &scratch_path, 256 * 1024 * 1024, 10, 32)?;
            std::fs::write(data_path.join("should_fail"), b"x")
                .map_err(crate::error::GatewayErr::Io)
        })
        .await
        .unwrap();

        assert!(outcome.is_err());
        let _ = Command::new("true").status().await;
    }

    #[tokio::test]
    async fn resource_limits_are_enforced_after_install() {
        let outcome = tokio::task::spawn_blocking(|| {
            install_resource_limits(256 * 1024 * 1024, 10, 32)?;
            let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
            // Safety: `rlim` is a valid, fully-initialized `rlimit` for the
            // duration of the call.
            let rc = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut rlim) };
            assert_eq!(rc, 0);
            assert_eq!(rlim.rlim_cur, 256 * 1024 * 1024);
            Ok::<_, crate::error::GatewayErr>(())
        })
        .await
        .unwrap();

        outcome.unwrap();
    }

    #[test]
    fn drop_root_privileges_is_a_no_op_when_already_non_root() {
        // Safety: getuid takes no arguments and never fails.
        if unsafe { libc::getuid() } == 0 {
            // Running as root would actually drop privileges for the rest of
            // this test binary; skip rather than risk breaking tests that
            // share the process.
            return;
        }
        assert!(drop_root_privileges().is_ok());
    }
}
