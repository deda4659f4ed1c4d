// SPDX-License-Identifier: Apache-2.0

//! crik CLI.
//!
//! Runs a command wrapped by the checkpoint/restore supervisor.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crik_core::supervisor;
use crik_core::Configuration;

/// crik - checkpoint and restore a process tree across nodes
#[derive(Parser)]
#[command(name = "crik", version, about, long_about = None)]
struct Cli {
    /// Enable debug mode.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run given command wrapped by crik.
    ///
    /// If the image directory already holds a checkpoint, the command vector
    /// is ignored and the checkpointed tree is restored instead.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "/etc/crik/config.yaml")]
        config_path: PathBuf,

        /// Command and its arguments to run. Required if imageDir is not
        /// given or holds no checkpoint.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("failed to run the command: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> crik_core::Result<i32> {
    match cli.command {
        Commands::Run {
            config_path,
            command,
        } => {
            let configuration = Configuration::load(&config_path)?;
            supervisor::run(configuration, command).await
        }
    }
}
