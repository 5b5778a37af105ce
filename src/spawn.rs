/// clone3-based child creation with namespace and cgroup placement.
///
/// The child is placed into its cgroup by the kernel at clone time
/// (CLONE_INTO_CGROUP), so there is no window in which it runs outside its
/// limits. It then re-execs the supervisor binary in init mode, which does
/// the in-namespace mount setup before exec'ing the user command.
use crate::types::{Result, TelePilotError};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// clone3 argument block (struct clone_args, linux/sched.h).
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// CLONE_INTO_CGROUP (Linux >= 5.7); libc does not export it.
const CLONE_INTO_CGROUP: u64 = 0x200000000;

/// # Safety
/// Forks the process. On the child side of the return only async-signal-safe
/// operations may follow.
unsafe fn clone3(args: &CloneArgs) -> nix::Result<libc::pid_t> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            args as *const CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };
    nix::errno::Errno::result(ret).map(|pid| pid as libc::pid_t)
}

/// A successfully cloned child, as seen from the supervisor.
pub struct SpawnedChild {
    pub pid: Pid,
    /// Read side of the merged stdout/stderr pipe.
    pub output: File,
    /// Read side of the init control channel. EOF without data means init
    /// handed off to the user command; any bytes are its error report.
    pub control: File,
}

/// Clone a child in fresh PID/mount/network namespaces, placed in the
/// cgroup behind `cgroup_fd`, exec'ing `exe` with `argv`. The child's
/// stdout and stderr both feed the returned output pipe; its FD 3 is the
/// write side of the control pipe.
pub fn spawn_namespaced(exe: &Path, argv: &[String], cgroup_fd: BorrowedFd) -> Result<SpawnedChild> {
    // Everything the child touches after the clone is prepared here, in the
    // parent: allocating in the child of a multithreaded process is not
    // async-signal-safe.
    let exe_c = CString::new(exe.as_os_str().as_bytes())
        .map_err(|_| TelePilotError::StartFailed("NUL byte in executable path".to_string()))?;
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| TelePilotError::StartFailed("NUL byte in argument".to_string()))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv_c.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let (out_r, out_w) = pipe()?;
    let (ctl_r, ctl_w) = pipe()?;
    let devnull = File::open("/dev/null")
        .map_err(|e| TelePilotError::StartFailed(format!("open /dev/null: {}", e)))?;

    let clone_args = CloneArgs {
        flags: (libc::CLONE_NEWPID | libc::CLONE_NEWNS | libc::CLONE_NEWNET) as u64
            | CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup_fd.as_raw_fd() as u64,
        ..CloneArgs::default()
    };

    let pid = unsafe { clone3(&clone_args) }
        .map_err(|e| TelePilotError::StartFailed(format!("clone3: {}", e)))?;

    if pid == 0 {
        // Child. Runs as PID 1 of the new namespaces until exec.
        child_exec(
            exe_c.as_ptr(),
            argv_ptrs.as_ptr(),
            devnull.as_raw_fd(),
            out_w.as_raw_fd(),
            ctl_w.as_raw_fd(),
        );
    }

    // Parent. The child-side pipe ends and /dev/null drop here, so the
    // output pipe EOFs when the job's last writer is gone.
    Ok(SpawnedChild {
        pid: Pid::from_raw(pid),
        output: File::from(out_r),
        control: File::from(ctl_r),
    })
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| TelePilotError::StartFailed(format!("pipe: {}", e)))
}

/// Child-side bootstrap between clone3 and exec. Async-signal-safe only:
/// no allocation, no locks, no Rust I/O.
fn child_exec(
    exe: *const libc::c_char,
    argv: *const *const libc::c_char,
    devnull: RawFd,
    out_w: RawFd,
    ctl_w: RawFd,
) -> ! {
    unsafe {
        // Own process group, for clean signal delivery.
        libc::setpgid(0, 0);

        install_fd(devnull, 0);
        install_fd(out_w, 1);
        install_fd(out_w, 2);
        // Control channel at a fixed slot; init relies on it being 3.
        install_fd(ctl_w, 3);

        libc::execv(exe, argv);

        // exec of our own binary failed. Report the one way we can.
        let msg = b"re-exec of supervisor binary failed";
        libc::write(3, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(127);
    }
}

/// dup2 `from` onto `to`, clearing close-on-exec on the result. dup2 is a
/// no-op when the descriptors are equal and would leave CLOEXEC set, hence
/// the explicit branch.
unsafe fn install_fd(from: RawFd, to: RawFd) {
    unsafe {
        if from == to {
            libc::fcntl(to, libc::F_SETFD, 0);
        } else {
            libc::dup2(from, to);
        }
    }
}
