/// Init-mode bootstrap: runs as PID 1 of a job's fresh namespaces, does the
/// mount setup that must happen before exec, then becomes the user command.
use crate::types::{Result, TelePilotError};
use nix::mount::{mount, MsFlags};
use std::env;
use std::ffi::CString;
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// The control channel back to the supervisor. The spawn path installs the
/// pipe at this slot; nothing else is inherited there.
pub const CONTROL_FD: i32 = 3;

/// Entry point for `telepilotd --init <command> [args...]`.
///
/// On success this never returns; the process image is replaced by the user
/// command. Failures are reported over the control pipe, the only channel
/// that exists this early, and exit non-zero.
pub fn run(args: &[String]) -> ! {
    let err = match setup_and_exec(args) {
        Err(e) => e,
        Ok(never) => match never {},
    };
    let fd = unsafe { BorrowedFd::borrow_raw(CONTROL_FD) };
    let _ = nix::unistd::write(fd, err.to_string().as_bytes());
    std::process::exit(1);
}

fn setup_and_exec(args: &[String]) -> Result<std::convert::Infallible> {
    let (command, rest) = args
        .split_first()
        .ok_or_else(|| TelePilotError::Process("missing command".to_string()))?;

    // Keep mount changes private to this namespace; without this the /proc
    // remount below could propagate back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| TelePilotError::Namespace(format!("mount / as private: {}", e)))?;

    // Remount /proc so it reflects the new PID namespace.
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| TelePilotError::Namespace(format!("remount /proc: {}", e)))?;

    let resolved = resolve_command(command)?;

    // The control pipe must vanish on exec so the supervisor reads EOF.
    let rc = unsafe { libc::fcntl(CONTROL_FD, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc != 0 {
        return Err(TelePilotError::Process(format!(
            "set control pipe close-on-exec: {}",
            std::io::Error::last_os_error()
        )));
    }

    let path_c = CString::new(resolved.as_os_str().as_bytes())
        .map_err(|_| TelePilotError::Process("NUL byte in resolved path".to_string()))?;
    let argv_c: Vec<CString> = std::iter::once(command)
        .chain(rest.iter())
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| TelePilotError::Process("NUL byte in argument".to_string()))?;

    let err = nix::unistd::execv(&path_c, &argv_c).unwrap_err();
    Err(TelePilotError::Process(format!(
        "exec {}: {}",
        resolved.display(),
        err
    )))
}

/// Resolve `command` the way a shell would: anything containing a slash is
/// taken as a path, bare names are searched along PATH.
fn resolve_command(command: &str) -> Result<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(TelePilotError::Process(format!(
            "no such executable: {}",
            command
        )));
    }

    let search = env::var_os("PATH").unwrap_or_default();
    lookup_in_dirs(command, env::split_paths(&search))
        .ok_or_else(|| TelePilotError::Process(format!("lookup path for {:?}: not found", command)))
}

fn lookup_in_dirs(command: &str, dirs: impl Iterator<Item = PathBuf>) -> Option<PathBuf> {
    for dir in dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
