//! The workernator server binary.
//!
//! Besides serving gRPC, this binary is its own container helper: the
//! runtime re-execs `/proc/self/exe` with the sentinel subcommands
//! `child-mode`, `setup-net-ns`, and `setup-veth`, so those are dispatched
//! here before any async runtime exists. `setup-veth` in particular must
//! stay on one thread across a `setns`.

mod config;
mod interceptors;
mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use joblib::container::{child, network, JobLimits, Runtime};
use joblib::images::Store;
use joblib::manager::{await_exit, Manager, ManagerConfig};
use protobuf::workernator_server::WorkernatorServer;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::Request;
use tracing::{error, info};

use crate::config::Config;
use crate::interceptors::cert;
use crate::services::jobservice::WorkernatorService;

#[derive(Debug, Parser)]
#[command(name = "workernator", about = "Remote job execution in containers over mTLS")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC server.
    Serve {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Pull an image and run one command in a container, no server needed.
    Run(RunArgs),
    /// Special command, do not use.
    #[command(name = "child-mode", hide = true)]
    ChildMode(ChildModeArgs),
    /// Special command, do not use.
    #[command(name = "setup-net-ns", hide = true)]
    SetupNetNs(HelperArgs),
    /// Special command, do not use.
    #[command(name = "setup-veth", hide = true)]
    SetupVeth(HelperArgs),
}

#[derive(Debug, Args)]
struct HelperArgs {
    lib: PathBuf,
    run: PathBuf,
    tmp: PathBuf,
    id: String,
}

#[derive(Debug, Args)]
struct LimitArgs {
    /// Max number of pids in the container.
    #[arg(long)]
    pid_limit: Option<i64>,
    /// Max memory in MB for the container.
    #[arg(long)]
    mem_limit: Option<i64>,
    /// CPU weight for the container, within [1, 10000].
    #[arg(long)]
    cpu_weight: Option<u64>,
    /// CPU bandwidth quota in microseconds; requires --cpu-period.
    #[arg(long)]
    cpu_max: Option<u64>,
    /// CPU bandwidth period in microseconds; requires --cpu-max.
    #[arg(long)]
    cpu_period: Option<u64>,
    /// Max bytes per second for io, reads and writes alike.
    #[arg(long)]
    io_bps: Option<u64>,
    /// Max iops for io, reads and writes alike.
    #[arg(long)]
    io_iops: Option<u64>,
}

impl From<LimitArgs> for JobLimits {
    fn from(args: LimitArgs) -> Self {
        JobLimits {
            pid_limit: args.pid_limit,
            memory_mb: args.mem_limit,
            cpu_weight: args.cpu_weight,
            cpu_max: args.cpu_max,
            cpu_period: args.cpu_period,
            io_bps: args.io_bps,
            io_iops: args.io_iops,
        }
    }
}

#[derive(Debug, Args)]
struct ChildModeArgs {
    #[command(flatten)]
    limits: LimitArgs,
    lib: PathBuf,
    run: PathBuf,
    tmp: PathBuf,
    id: String,
    command: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, default_value = "/var/lib/workernator")]
    lib: PathBuf,
    #[arg(long = "run-path", default_value = "/var/run/workernator")]
    run: PathBuf,
    #[arg(long, default_value = "/tmp/workernator")]
    tmp: PathBuf,
    #[command(flatten)]
    limits: LimitArgs,
    /// Image to run in, e.g. alpine:latest.
    image: String,
    command: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::ChildMode(args) => child_mode(args),
        Command::SetupNetNs(args) => helper_net_ns(args),
        Command::SetupVeth(args) => helper_veth(args),
        Command::Serve { config } => serve_command(&config),
        Command::Run(args) => run_command(args),
    }
}

fn child_mode(args: ChildModeArgs) -> ExitCode {
    let spec = child::ChildSpec {
        lib: args.lib,
        run: args.run,
        tmp: args.tmp,
        id: args.id,
        limits: args.limits.into(),
        command: args.command,
        args: args.args,
    };
    // run() only returns when a setup step or the exec itself failed
    match child::run(&spec) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unable to launch container command: {err}");
            ExitCode::FAILURE
        }
    }
}

fn helper_net_ns(args: HelperArgs) -> ExitCode {
    match network::setup_net_ns(&args.run, &args.id) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unable to set up network namespace: {err}");
            ExitCode::FAILURE
        }
    }
}

fn helper_veth(args: HelperArgs) -> ExitCode {
    // current-thread runtime: setns moves this thread into the container
    // namespace halfway through, and the second netlink socket has to be
    // opened from inside it
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("unable to build runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(network::setup_veth(&args.run, &args.id)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unable to set up veth devices: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn serve_command(config_path: &std::path::Path) -> ExitCode {
    init_logging();

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "unable to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => {
            info!("server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "server exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let manager = Manager::new(ManagerConfig {
        output_path: config.output_path.clone(),
        lib_path: config.lib_path.clone(),
        run_path: config.run_path.clone(),
        tmp_path: config.tmp_path.clone(),
        image: config.image.clone(),
        limits: config.limits.clone(),
    })
    .await
    .context("unable to set up job manager")?;

    let cert = tokio::fs::read(&config.cert_path)
        .await
        .context("unable to read server certificate")?;
    let key = tokio::fs::read(&config.key_path)
        .await
        .context("unable to read server key")?;
    let chain = tokio::fs::read(&config.chain_path)
        .await
        .context("unable to read ca chain")?;

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(chain))
        .client_auth_optional(false);

    let acl = config.acl.clone();
    let service = WorkernatorService::new(manager, acl.clone());
    let interceptor_acl = Arc::new(acl);
    let server = WorkernatorServer::with_interceptor(service, move |req: Request<()>| {
        cert::authenticate(req, &interceptor_acl)
    });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port.trim())
        .parse()
        .context("unable to parse listen address")?;
    info!(%addr, "launching grpc server");

    Server::builder()
        .tls_config(tls)
        .context("unable to set up mTLS")?
        .add_service(server)
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("grpc server failed")?;
    Ok(())
}

/// Resolves when any of SIGINT, SIGTERM, SIGQUIT, or SIGABRT arrives; the
/// server then stops accepting and drains in-flight calls. Running jobs are
/// left alone and outlive the server.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("unable to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("unable to install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("unable to install SIGQUIT handler");
    let mut abort =
        signal(SignalKind::from_raw(libc::SIGABRT)).expect("unable to install SIGABRT handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
        _ = abort.recv() => {}
    }
    info!("received signal to exit");
}

fn run_command(args: RunArgs) -> ExitCode {
    init_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "unable to build runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_in_container(args)) {
        Ok(exit) => {
            info!(exit, "container finished running");
            if exit == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "container failed to run");
            ExitCode::FAILURE
        }
    }
}

/// One-shot debug path: same container construction as a server job, but
/// the child inherits this process's stdout/stderr instead of writing the
/// per-job output files, so diagnostics land on the invoking terminal.
async fn run_in_container(args: RunArgs) -> anyhow::Result<i32> {
    let limits: JobLimits = args.limits.into();
    limits.validate().context("invalid limits")?;

    let store = Arc::new(
        Store::new(&args.lib, &args.tmp).context("unable to set up image store")?,
    );
    let runtime = Runtime::new(args.lib, args.run, args.tmp, store)
        .context("unable to set up container runtime")?;
    network::ensure_bridge()
        .await
        .context("unable to set up bridge")?;

    let image = runtime
        .store()
        .get_image(&args.image)
        .await
        .with_context(|| format!("unable to get image '{}'", args.image))?;
    let id = xid::new().to_string();
    let container = runtime
        .prepare(&image, &id)
        .await
        .context("unable to prepare container")?;
    info!(container = %id, image = %args.image, "container running");

    let pid = match runtime.launch(
        &container,
        &args.command,
        &args.args,
        &limits,
        &std::io::stdout(),
        &std::io::stderr(),
    ) {
        Ok(pid) => pid,
        Err(err) => {
            runtime.cleanup(&container);
            return Err(err).context("unable to launch container");
        }
    };

    let status = await_exit(pid).await;
    runtime.cleanup(&container);
    Ok(status.exit_code().unwrap_or(-1))
}
