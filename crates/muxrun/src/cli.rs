//! Command-line definition

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use muxrun_exec::Mode;

#[derive(Parser)]
#[command(name = "muxrun")]
#[command(about = "Run commands on many hosts over persistent shell sessions", long_about = None)]
pub struct Cli {
    /// Config file, instead of the default search path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command on every host
    #[command(name = "run")]
    Run {
        /// Target host, repeatable
        #[arg(long = "host", default_value = "localhost")]
        hosts: Vec<String>,
        /// Join the arguments into one `/bin/sh -c` string
        #[arg(long)]
        shell: bool,
        /// Seconds to wait for each host
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Probe hosts and print their liveness
    #[command(name = "ping")]
    Ping {
        /// Target host, repeatable
        #[arg(long = "host", default_value = "localhost")]
        hosts: Vec<String>,
    },

    /// Serve one batch on stdin/stdout
    #[command(name = "coordinator", hide = true)]
    Coordinator {
        #[arg(long, default_value_t = Mode::Argv)]
        mode: Mode,
        /// Seconds before the whole batch is abandoned, 0 for no limit
        #[arg(long)]
        max_runtime: Option<u64>,
    },
}
