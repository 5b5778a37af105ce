/// A single supervised job: identity, terminal state, output fan-out.
use crate::broadcaster::Broadcaster;
use crate::types::JobStatus;
use crossbeam_channel::{bounded, Receiver, Sender};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

/// One-shot broadcast that flips from pending to released exactly once,
/// when the job reached a terminal state and its broadcaster was closed.
///
/// Built on a zero-capacity channel: nothing is ever sent, releasing drops
/// the sender and every receiver (current and future) observes the
/// disconnect.
pub struct WaitSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Default for WaitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        WaitSignal {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Release the signal; idempotent.
    pub fn release(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_released(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }

    /// Block until released.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// A receiver usable in a `select!` against other channels; becomes
    /// ready (disconnected) on release.
    pub fn watch(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

pub struct JobState {
    pub status: JobStatus,
    /// Process exit status; meaningful only once status is terminal.
    /// -1 when the child was killed by a signal.
    pub exit_code: i32,
}

pub struct Job {
    pub id: Uuid,
    /// Authenticated principal that created the job. Immutable; the basis
    /// of every authorization decision made above the core.
    pub owner: String,
    pub command: String,
    pub args: Vec<String>,
    pub cgroup_path: PathBuf,
    pub(crate) pid: Pid,
    pub(crate) state: RwLock<JobState>,
    pub broadcaster: Broadcaster,
    pub(crate) done: WaitSignal,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("cgroup_path", &self.cgroup_path)
            .finish()
    }
}

impl Job {
    pub fn new(
        id: Uuid,
        owner: &str,
        command: &str,
        args: &[String],
        cgroup_path: PathBuf,
        pid: Pid,
    ) -> Self {
        Job {
            id,
            owner: owner.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            cgroup_path,
            pid,
            state: RwLock::new(JobState {
                status: JobStatus::Running,
                exit_code: -1,
            }),
            broadcaster: Broadcaster::new(),
            done: WaitSignal::new(),
        }
    }

    /// Current status and exit code under the job lock. The exit code is
    /// meaningful only when the status is terminal.
    pub fn status(&self) -> (JobStatus, i32) {
        let state = self.state.read().unwrap();
        (state.status, state.exit_code)
    }

    /// Block until the job is terminal, its broadcaster closed and its
    /// cgroup teardown finished (or given up on).
    pub fn wait(&self) {
        self.done.wait();
    }
}
