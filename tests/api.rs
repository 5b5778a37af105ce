//! Client/server tests over the wire protocol.
//!
//! The authorization tests need no privileges and always run; the full
//! session test starts real jobs and skips without root + cgroup2.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use telepilot::cgroup;
use telepilot::client::ApiClient;
use telepilot::manager::JobManager;
use telepilot::protocol::PERMISSION_DENIED;
use telepilot::server::Server;
use telepilot::types::{JobStatus, TelePilotError};
use uuid::Uuid;

fn spawn_server(manager: JobManager) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    thread::spawn(move || {
        let server = Server::new(Arc::new(manager));
        let _ = server.serve_listener(listener);
    });
    addr
}

fn remote_message(err: TelePilotError) -> String {
    match err {
        TelePilotError::Remote(message) => message,
        other => panic!("expected remote error, got: {}", other),
    }
}

#[test]
fn test_unknown_job_is_permission_denied_on_the_wire() {
    let manager = JobManager::with_supervisor_exe(PathBuf::from("/bin/false"));
    let addr = spawn_server(manager);

    let mut client = ApiClient::connect(&addr, "alice").expect("connect");
    let id = Uuid::new_v4();

    let err = client.job_status(&id).expect_err("status must fail");
    assert_eq!(remote_message(err), PERMISSION_DENIED);

    let err = client.stop_job(&id).expect_err("stop must fail");
    assert_eq!(remote_message(err), PERMISSION_DENIED);

    let mut sink = Vec::new();
    let err = client
        .stream_logs(&id, &mut sink)
        .expect_err("stream must fail");
    assert_eq!(remote_message(err), PERMISSION_DENIED);
}

#[test]
fn test_connection_requires_hello() {
    let manager = JobManager::with_supervisor_exe(PathBuf::from("/bin/false"));
    let addr = spawn_server(manager);

    // An empty identity is not an identity.
    assert!(ApiClient::connect(&addr, "").is_err());
}

fn supervised_env_available() -> bool {
    nix::unistd::geteuid().is_root() && Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

#[test]
fn test_full_session_with_ownership_boundary() {
    if !supervised_env_available() {
        eprintln!("skipping: requires root and a cgroup2 hierarchy");
        return;
    }
    cgroup::initial_setup().expect("cgroup setup");

    let manager =
        JobManager::with_supervisor_exe(PathBuf::from(env!("CARGO_BIN_EXE_telepilotd")));
    let addr = spawn_server(manager);

    let mut alice = ApiClient::connect(&addr, "alice").expect("connect alice");
    let id = alice
        .start_job("sh", &["-c".to_string(), "echo hello".to_string()])
        .expect("start job");

    // Poll until the job settles; the wire has no wait primitive.
    let deadline = Instant::now() + Duration::from_secs(5);
    let (status, exit_code) = loop {
        let (status, exit_code) = alice.job_status(&id).expect("status");
        if status != JobStatus::Running {
            break (status, exit_code);
        }
        assert!(Instant::now() < deadline, "job did not settle in time");
        thread::sleep(Duration::from_millis(20));
    };
    assert_eq!((status, exit_code), (JobStatus::Exited, Some(0)));

    let mut logs = Vec::new();
    alice.stream_logs(&id, &mut logs).expect("stream logs");
    assert_eq!(logs, b"hello\n");

    // Another principal sees the job as if it did not exist.
    let mut bob = ApiClient::connect(&addr, "bob").expect("connect bob");
    let err = bob.job_status(&id).expect_err("bob must be denied");
    assert_eq!(remote_message(err), PERMISSION_DENIED);
}
