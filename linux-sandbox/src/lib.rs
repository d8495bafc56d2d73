//! Entry point shared by the `tabulon-linux-sandbox` binary and its tests:
//! apply Landlock + seccomp hardening to the current (about to be replaced)
//! process, then `execv` into the runner binary. Never returns on success.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

/// `argv[1..]` this helper expects: the read-only dataset root, the writable
/// scratch root, the runner binary to exec into once hardened, and the three
/// resource limits to apply first (memory bytes, CPU seconds, max processes).
pub struct Args {
    pub datasets_dir: String,
    pub scratch_dir: String,
    pub runner_path: String,
    pub memory_limit_bytes: u64,
    pub cpu_limit_seconds: u64,
    pub max_processes: u64,
}

impl Args {
    pub fn parse(argv: &[String]) -> Result<Self> {
        match argv {
            [datasets_dir, scratch_dir, runner_path, memory_limit_bytes, cpu_limit_seconds, max_processes] => {
                Ok(Self {
                    datasets_dir: datasets_dir.clone(),
                    scratch_dir: scratch_dir.clone(),
                    runner_path: runner_path.clone(),
                    memory_limit_bytes: memory_limit_bytes
                        .parse()
                        .context("memory_limit_bytes must be a non-negative integer")?,
                    cpu_limit_seconds: cpu_limit_seconds
                        .parse()
                        .context("cpu_limit_seconds must be a non-negative integer")?,
                    max_processes: max_processes.parse().context("max_processes must be a non-negative integer")?,
                })
            }
            _ => bail!(
                "usage: tabulon-linux-sandbox <datasets_dir> <scratch_dir> <runner_path> \
                 <memory_limit_bytes> <cpu_limit_seconds> <max_processes>"
            ),
        }
    }
}

/// Applies the hardening envelope then execs into the runner. Only returns
/// on error; a successful `exec` replaces this process image entirely.
pub fn run_main(args: Args) -> Result<()> {
    tabulon_core::exec::sandboxing::apply_to_current_thread(
        Path::new(&args.datasets_dir),
        Path::new(&args.scratch_dir),
        args.memory_limit_bytes,
        args.cpu_limit_seconds,
        args.max_processes,
    )
    .context("failed to apply sandbox policy")?;

    exec_into(&args.runner_path)
}

#[cfg(target_os = "linux")]
fn exec_into(runner_path: &str) -> Result<()> {
    use std::ffi::CString;

    let c_path = CString::new(runner_path).context("runner path contains a NUL byte")?;
    let argv = [c_path.as_ptr(), std::ptr::null()];

    // Safety: `argv` is NUL-terminated and `c_path` outlives the call.
    unsafe {
        libc::execv(c_path.as_ptr(), argv.as_ptr());
    }

    bail!(
        "execv into runner failed: {}",
        std::io::Error::last_os_error()
    )
}

#[cfg(not(target_os = "linux"))]
fn exec_into(_runner_path: &str) -> Result<()> {
    bail!("tabulon-linux-sandbox only runs on Linux")
}
