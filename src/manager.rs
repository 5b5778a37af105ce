/// Job lifecycle engine and process-wide registry.
use crate::cgroup::JobCgroup;
use crate::job::Job;
use crate::spawn;
use crate::types::{JobStatus, Result, TelePilotError};
use crossbeam_channel::{bounded, select, Sender};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{Cursor, Read};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;
use uuid::Uuid;

/// Buffer size for the output pump, matching the chunking the broadcaster
/// fans out.
const READ_BUF_SIZE: usize = 32 * 1024;

/// The main controller: owns every job for the life of the supervisor.
pub struct JobManager {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
    /// Binary re-exec'd as the in-namespace init of each job.
    supervisor_exe: PathBuf,
}

impl JobManager {
    /// Manager re-exec'ing the currently running binary, which is the right
    /// choice for the daemon itself.
    pub fn new() -> Result<Self> {
        let exe = env::current_exe()
            .map_err(|e| TelePilotError::Process(format!("lookup self path: {}", e)))?;
        Ok(Self::with_supervisor_exe(exe))
    }

    /// Manager re-exec'ing an explicit supervisor binary. Test harnesses
    /// are not the supervisor, so they point this at the built daemon.
    pub fn with_supervisor_exe(exe: PathBuf) -> Self {
        JobManager {
            jobs: RwLock::new(HashMap::new()),
            supervisor_exe: exe,
        }
    }

    /// Start a job for `owner`. On success the job is registered and
    /// running; any failure leaves no trace behind.
    pub fn start_job(&self, owner: &str, command: &str, args: &[String]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let (cgroup, cgroup_fd) = JobCgroup::create(&id)?;

        let mut argv = vec![
            "telepilotd".to_string(),
            "--init".to_string(),
            command.to_string(),
        ];
        argv.extend_from_slice(args);

        let spawned = match spawn::spawn_namespaced(&self.supervisor_exe, &argv, cgroup_fd.as_fd())
        {
            Ok(spawned) => spawned,
            Err(e) => {
                // No child was created; only the cgroup needs undoing.
                if let Err(ce) = cgroup.cleanup() {
                    log::warn!("Cgroup cleanup after failed clone: {}", ce);
                }
                return Err(e);
            }
        };
        // The clone placed the child; the descriptor has done its job.
        drop(cgroup_fd);

        // Read the control channel until EOF. Any bytes are the init-stage
        // error report and mean the child never reached the user command.
        let mut control = spawned.control;
        let mut init_err = Vec::new();
        if let Err(e) = control.read_to_end(&mut init_err) {
            log::warn!("Control pipe read for job {}: {}", id, e);
        }
        if !init_err.is_empty() {
            // The child is exiting on its own; reap it, then clean up as if
            // the clone itself had failed.
            let _ = waitpid(spawned.pid, None);
            if let Err(ce) = cgroup.cleanup() {
                log::warn!("Cgroup cleanup after failed init: {}", ce);
            }
            return Err(TelePilotError::StartFailed(
                String::from_utf8_lossy(&init_err).into_owned(),
            ));
        }

        let job = Arc::new(Job::new(
            id,
            owner,
            command,
            args,
            cgroup.path().to_path_buf(),
            spawned.pid,
        ));

        // Pump the merged stdout/stderr into the broadcaster until EOF. The
        // reaper joins this before closing the broadcaster, so every byte
        // the child got out reaches the history.
        let pump = {
            let job = Arc::clone(&job);
            let mut output = spawned.output;
            thread::spawn(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match output.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => job.broadcaster.write(&buf[..n]),
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })
        };

        // Reaper: settles the terminal state and releases the wait signal.
        {
            let job = Arc::clone(&job);
            thread::spawn(move || reap(&job, &cgroup, pump));
        }

        self.jobs.write().unwrap().insert(id, Arc::clone(&job));
        Ok(id)
    }

    pub fn lookup(&self, id: &Uuid) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(TelePilotError::JobNotFound)
    }

    /// Kill a running job and block until its cleanup finished. Idempotent:
    /// stopping a terminal job succeeds without touching it.
    pub fn stop_job(&self, id: &Uuid) -> Result<()> {
        let job = self.lookup(id)?;
        {
            let mut state = job.state.write().unwrap();
            if state.status == JobStatus::Running {
                match kill(job.pid, Signal::SIGKILL) {
                    Ok(()) => state.status = JobStatus::Stopped,
                    // The child died just before the kill landed. Leave the
                    // label to the reaper; the race is benign.
                    Err(Errno::ESRCH) => {}
                    Err(e) => {
                        return Err(TelePilotError::Process(format!(
                            "kill job {}: {}",
                            id, e
                        )))
                    }
                }
            }
        }
        // By the time we return the broadcaster is closed and the cgroup is
        // gone (or logged as leaked).
        job.wait();
        Ok(())
    }

    pub fn job_status(&self, id: &Uuid) -> Result<(JobStatus, i32)> {
        Ok(self.lookup(id)?.status())
    }

    /// Stream the job's merged output from the beginning: everything
    /// written so far, then live bytes until the job ends or the stream is
    /// dropped. Terminal jobs replay their history only.
    pub fn stream_logs(&self, id: &Uuid) -> Result<LogStream> {
        let job = self.lookup(id)?;

        {
            let state = job.state.read().unwrap();
            if state.status.is_terminal() {
                return Ok(LogStream::historical(job.broadcaster.snapshot()));
            }
        }

        let (pipe_r, pipe_w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| TelePilotError::Process(format!("log pipe: {}", e)))?;
        let sink = Box::new(File::from(pipe_w));
        let (sub_id, snapshot) = match job.broadcaster.subscribe_and_snapshot(sink) {
            Some(subscribed) => subscribed,
            // The job went terminal since the status check; serve history.
            None => return Ok(LogStream::historical(job.broadcaster.snapshot())),
        };

        // Watcher: unsubscribes on job exit or caller cancellation,
        // whichever comes first. Unsubscribing ends the forwarder, which
        // drops the pipe's write side, which EOFs the reader below.
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        {
            let job = Arc::clone(&job);
            thread::spawn(move || {
                let done = job.done.watch();
                select! {
                    recv(done) -> _ => {}
                    recv(cancel_rx) -> _ => {}
                }
                if let Err(e) = job.broadcaster.unsubscribe(sub_id) {
                    log::warn!("Unsubscribe at stream end: {}", e);
                }
            });
        }

        Ok(LogStream {
            reader: Box::new(Cursor::new(snapshot).chain(File::from(pipe_r))),
            _cancel: Some(cancel_tx),
        })
    }
}

/// Wait for the child, settle the terminal state, drain its output, close
/// the fan-out, tear the cgroup down, release the wait signal. Strictly in
/// that order: the released signal promises the history is complete,
/// subscribers are finished and cleanup ran.
fn reap(job: &Job, cgroup: &JobCgroup, pump: thread::JoinHandle<()>) {
    let exit_code = loop {
        match waitpid(job.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(..)) => break -1,
            Ok(status) => {
                log::debug!("Unexpected wait status for job {}: {:?}", job.id, status);
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                log::warn!("waitpid for job {}: {}", job.id, e);
                break -1;
            }
        }
    };

    {
        let mut state = job.state.write().unwrap();
        // A concurrent stop may already have labeled the job; the label
        // stands, only the exit code is ours to record.
        if state.status == JobStatus::Running {
            state.status = JobStatus::Exited;
        }
        state.exit_code = exit_code;
    }

    // The pump and the reap are woken by the same event, so the pump may
    // still be appending the last bytes it read. Wait for it to hit EOF
    // before closing, or that tail would never enter the history. No
    // writer outlives the pipe for long: init's death took the whole PID
    // namespace with it.
    if pump.join().is_err() {
        log::warn!("Output pump for job {} panicked", job.id);
    }

    job.broadcaster.close();
    if let Err(e) = cgroup.cleanup() {
        log::warn!("Deferred cgroup cleanup for job {}: {}", job.id, e);
    }
    job.done.release();
}

/// A readable log stream: history snapshot spliced with live output.
/// Dropping it cancels the subscription.
pub struct LogStream {
    reader: Box<dyn Read + Send>,
    _cancel: Option<Sender<()>>,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream").finish_non_exhaustive()
    }
}

impl LogStream {
    fn historical(history: Vec<u8>) -> Self {
        LogStream {
            reader: Box::new(Cursor::new(history)),
            _cancel: None,
        }
    }
}

impl Read for LogStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

#[cfg(test)]
impl JobManager {
    /// Register a hand-built job, bypassing start. Test support only.
    pub(crate) fn insert_for_test(&self, job: Arc<Job>) {
        self.jobs.write().unwrap().insert(job.id, job);
    }
}
