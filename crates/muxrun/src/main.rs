//! muxrun
//!
//! Runs commands on many hosts at once, keeping one shell session per host

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use muxrun_core::{Dispatcher, Liveness};
use muxrun_exec::coordinator::DEFAULT_MAX_RUNTIME;
use muxrun_exec::{Command, Coordinator, Mode};

mod cli;
mod config;
mod output;

use cli::{Cli, Commands};
use config::MuxConfig;

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if let Commands::Coordinator { mode, max_runtime } = cli.command {
        // stdout is the protocol channel
        init_tracing("warn");
        return serve_coordinator(mode, max_runtime);
    }

    let config = match &cli.config {
        Some(path) => MuxConfig::load(path)?,
        None => MuxConfig::load_default()?,
    };
    init_tracing(&config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli.command, config))
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serve_coordinator(mode: Mode, max_runtime: Option<u64>) -> Result<ExitCode> {
    let max_runtime = match max_runtime {
        None => Some(DEFAULT_MAX_RUNTIME),
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    };

    debug!(%mode, ?max_runtime, "serving coordinator");
    Coordinator::new(mode)
        .with_max_runtime(max_runtime)
        .serve_stdio()?;
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(command: Commands, config: MuxConfig) -> Result<ExitCode> {
    let dispatcher = Dispatcher::new(config.dispatcher);

    let code = match command {
        Commands::Run {
            hosts,
            shell,
            timeout,
            command,
        } => run(&dispatcher, hosts, shell, Duration::from_secs(timeout), command).await?,
        Commands::Ping { hosts } => ping(&dispatcher, hosts).await?,
        Commands::Coordinator { .. } => ExitCode::SUCCESS,
    };

    dispatcher.shutdown_all().await;
    Ok(code)
}

async fn run(
    dispatcher: &Dispatcher,
    hosts: Vec<String>,
    shell: bool,
    timeout: Duration,
    argv: Vec<String>,
) -> Result<ExitCode> {
    let (mode, command) = if shell {
        (Mode::Shell, Command::shell(argv.join(" ")))
    } else {
        (Mode::Argv, Command::argv(argv))
    };

    debug!(hosts = hosts.len(), %mode, ?timeout, "submitting command");
    let pairs = hosts.into_iter().map(|host| (host, command.clone()));
    let mut results = dispatcher.submit_multi_host(pairs, mode, timeout).await?;

    let mut failed = false;
    while let Some((host, result)) = results.next().await {
        failed |= !result.success();
        output::write_result(&mut std::io::stdout().lock(), &host, &result)?;
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn ping(dispatcher: &Dispatcher, hosts: Vec<String>) -> Result<ExitCode> {
    let mut probes = JoinSet::new();
    for host in hosts {
        let dispatcher = dispatcher.clone();
        probes.spawn(async move {
            let liveness = dispatcher.probe(&host).await;
            (host, liveness)
        });
    }

    let mut all_alive = true;
    while let Some(joined) = probes.join_next().await {
        let (host, liveness) = joined?;
        let liveness = liveness?;
        all_alive &= liveness == Liveness::Alive;
        output::write_liveness(&mut std::io::stdout().lock(), &host, liveness)?;
    }

    Ok(if all_alive {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
