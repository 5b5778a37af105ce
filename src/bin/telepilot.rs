use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use telepilot::client::ApiClient;
use telepilot::server::DEFAULT_LISTEN_ADDR;
use uuid::Uuid;

/// TelePilot operator CLI.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Supervisor address.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    server: String,

    /// Identity to act as.
    #[arg(long)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a job.
    Start {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Stop a running job.
    Stop { id: Uuid },
    /// Show a job's status.
    Status { id: Uuid },
    /// Stream a job's merged output from the beginning.
    Logs { id: Uuid },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut client = ApiClient::connect(&cli.server, &cli.user)
        .with_context(|| format!("connect to {}", cli.server))?;

    match cli.command {
        Commands::Start { command } => {
            let Some((program, args)) = command.split_first() else {
                bail!("missing command");
            };
            let id = client.start_job(program, args).context("start job")?;
            println!("{}", id);
        }
        Commands::Stop { id } => {
            client.stop_job(&id).context("stop job")?;
        }
        Commands::Status { id } => {
            let (status, exit_code) = client.job_status(&id).context("job status")?;
            match exit_code {
                Some(code) => println!("{} ({})", status, code),
                None => println!("{}", status),
            }
        }
        Commands::Logs { id } => {
            let stdout = std::io::stdout();
            client
                .stream_logs(&id, &mut stdout.lock())
                .context("stream logs")?;
        }
    }
    Ok(())
}
