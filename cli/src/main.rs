mod client_cli;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use client_cli::ClientCli;

/// Connect to a workernator job server.
#[derive(Debug, Parser)]
struct Cli {
    /// The address of the server, host:port.
    #[arg(short = 's', long = "server")]
    server: String,
    /// Server name expected on the server's certificate.
    #[arg(long, default_value = "localhost")]
    domain: String,
    /// PEM-encoded client certificate.
    #[arg(long)]
    cert: PathBuf,
    /// PEM-encoded client key.
    #[arg(long)]
    key: PathBuf,
    /// PEM-encoded CA certificate the server's certificate chains to.
    #[arg(long)]
    ca: PathBuf,
    /// The sub-command to issue.
    #[command(subcommand)]
    sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Start a new job.
    Start {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop a running job.
    Stop { job_id: String },
    /// Query the status of a job.
    Status { job_id: String },
    /// Stream the output of a job.
    Output { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut client =
        match ClientCli::connect(&cli.server, &cli.domain, &cli.cert, &cli.key, &cli.ca).await {
            Ok(client) => client,
            Err(err) => {
                eprintln!("{err:#}");
                return ExitCode::FAILURE;
            }
        };

    let result = match cli.sub_command {
        SubCommand::Start { command, args } => client.start(command, args).await,
        SubCommand::Stop { job_id } => client.stop(job_id).await,
        SubCommand::Status { job_id } => client.status(job_id).await,
        SubCommand::Output { job_id } => client.output(job_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
