/// Cgroup v2 management for per-job resource limits
use crate::blockdev;
use crate::types::{Result, TelePilotError};
use std::fs;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Base cgroup for the supervisor; per-job cgroups live directly under it.
pub const CGROUP_BASE_PATH: &str = "/sys/fs/cgroup/telepilot";

pub const CPU_MAX: &str = "50000 100000"; // 50% of one CPU (quota per period, usec).
pub const MEMORY_MAX: &str = "52428800"; // 50 MiB.
pub const IO_MAX: &str = "rbps=1048576 wbps=1048576"; // 1 MiB/s read and write.

const CLEANUP_ATTEMPTS: u32 = 100;
const CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Create the supervisor base cgroup if needed and enable the subtree
/// controllers required by per-job limits. Invoked once at boot; an
/// unusable cgroup hierarchy is fatal.
pub fn initial_setup() -> Result<()> {
    initial_setup_at(Path::new(CGROUP_BASE_PATH))
}

fn initial_setup_at(base: &Path) -> Result<()> {
    fs::create_dir_all(base)
        .map_err(|e| TelePilotError::Cgroup(format!("create base cgroup {}: {}", base.display(), e)))?;

    // The kernel materializes this file on any real cgroup2 directory. If it
    // is missing we are not on a cgroup2 mount; refuse to start.
    let control_path = base.join("cgroup.subtree_control");
    let current = fs::read_to_string(&control_path)
        .map_err(|e| TelePilotError::Cgroup(format!("read subtree control: {}", e)))?;

    let mut needed = vec!["cpu", "memory", "io"];
    needed.retain(|ctrl| !current.split_whitespace().any(|c| c == *ctrl));
    log::debug!(
        "Subtree controls: current=[{}] enabling={:?}",
        current.trim(),
        needed
    );

    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(&control_path)
        .map_err(|e| TelePilotError::Cgroup(format!("open subtree control: {}", e)))?;
    for ctrl in needed {
        f.write_all(format!("+{}", ctrl).as_bytes())
            .map_err(|e| TelePilotError::Cgroup(format!("enable {} control: {}", ctrl, e)))?;
    }
    Ok(())
}

/// A per-job cgroup directory with the preset CPU/memory/I/O limits applied.
pub struct JobCgroup {
    path: PathBuf,
}

impl JobCgroup {
    /// Create the cgroup for a job and return it together with an open
    /// descriptor on the directory. The descriptor is what allows the child
    /// to be placed in the cgroup atomically at clone time; the caller owns
    /// it and closes it once the clone happened.
    pub fn create(job_id: &Uuid) -> Result<(Self, OwnedFd)> {
        let devices = blockdev::discover()?;
        Self::create_at(Path::new(CGROUP_BASE_PATH), job_id, &devices)
    }

    fn create_at(base: &Path, job_id: &Uuid, devices: &[String]) -> Result<(Self, OwnedFd)> {
        let path = base.join(format!("job-{}", job_id));
        if let Err(e) = fs::create_dir(&path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(TelePilotError::Cgroup(format!(
                    "create cgroup {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let cgroup = JobCgroup { path };
        match cgroup
            .apply_limits(devices)
            .and_then(|()| cgroup.open_dir())
        {
            Ok(fd) => Ok((cgroup, fd)),
            Err(e) => {
                // Don't leave a half-configured directory behind.
                let _ = fs::remove_dir(&cgroup.path);
                Err(e)
            }
        }
    }

    fn apply_limits(&self, devices: &[String]) -> Result<()> {
        fs::write(self.path.join("cpu.max"), CPU_MAX)
            .map_err(|e| TelePilotError::Cgroup(format!("set cpu.max: {}", e)))?;
        fs::write(self.path.join("memory.max"), MEMORY_MAX)
            .map_err(|e| TelePilotError::Cgroup(format!("set memory.max: {}", e)))?;

        let mut io_file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.join("io.max"))
            .map_err(|e| TelePilotError::Cgroup(format!("open io.max: {}", e)))?;
        for device in devices {
            io_file
                .write_all(format!("{} {}\n", device, IO_MAX).as_bytes())
                .map_err(|e| {
                    TelePilotError::Cgroup(format!("set io.max for {}: {}", device, e))
                })?;
        }
        Ok(())
    }

    fn open_dir(&self) -> Result<OwnedFd> {
        let dir = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(&self.path)
            .map_err(|e| TelePilotError::Cgroup(format!("open cgroup dir: {}", e)))?;
        Ok(OwnedFd::from(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tear the cgroup down after the job ended. Freezes and kills whatever
    /// still lives in it, waits for the process list to drain, then removes
    /// the directory. Bounded: once the retries are exhausted the directory
    /// leaks and the error is reported for the caller to log.
    pub fn cleanup(&self) -> Result<()> {
        for _ in 0..CLEANUP_ATTEMPTS {
            // Quiesce stragglers, then kill everything still in the group.
            // Both are best effort: the files vanish with the directory.
            let _ = fs::write(self.path.join("cgroup.freeze"), "1");
            let _ = fs::write(self.path.join("cgroup.kill"), "1");

            let procs = fs::read_to_string(self.path.join("cgroup.procs")).unwrap_or_default();
            if procs.trim().is_empty() {
                match fs::remove_dir(&self.path) {
                    Ok(()) => return Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    // Busy: a process left cgroup.procs but is not fully
                    // reaped yet. Retry.
                    Err(e) => log::debug!("remove cgroup {}: {}", self.path.display(), e),
                }
            }
            thread::sleep(CLEANUP_INTERVAL);
        }
        Err(TelePilotError::Cgroup(format!(
            "cgroup {} still busy after {} attempts, leaking directory",
            self.path.display(),
            CLEANUP_ATTEMPTS
        )))
    }
}
