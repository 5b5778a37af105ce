use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use telepilot::manager::JobManager;
use telepilot::server::{Server, DEFAULT_LISTEN_ADDR};
use telepilot::{cgroup, initd};

/// TelePilot supervisor daemon.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Address to serve the API on.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Internal flag: run as the in-namespace init of a job.
    #[arg(long, hide = true)]
    init: bool,

    /// In init mode, the job command and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_shutdown_handler() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("install SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("install SIGTERM handler")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        // Child side of a job start; never returns.
        initd::run(&args.command);
    }

    env_logger::init();

    cgroup::initial_setup().context("cgroup setup")?;
    install_shutdown_handler()?;

    let manager = Arc::new(JobManager::new().context("job manager")?);
    let listen = args.listen;
    thread::spawn(move || {
        let server = Server::new(manager);
        if let Err(e) = server.serve(&listen) {
            log::error!("Serve error: {}", e);
            std::process::exit(1);
        }
    });

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    log::info!("Bye.");
    Ok(())
}
