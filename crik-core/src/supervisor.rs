// SPDX-License-Identifier: Apache-2.0

//! The supervisor state machine.
//!
//! One invocation either restores a process tree from the image directory or
//! runs a fresh child prepared for a later checkpoint. In run mode the
//! supervisor parks on the child and the SIGTERM stream; the first signal
//! decides, with the oracle's help, between forwarding the signal and taking
//! a checkpoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

use crate::config::Configuration;
use crate::criu;
use crate::error::{ConfigError, Error, NamespacePrepError};
use crate::image;
use crate::node::{client, NodeState};

/// Writing this file raises the PID the kernel hands to the next process.
const NS_LAST_PID: &str = "/proc/sys/kernel/ns_last_pid";

/// First child PID floor. Restored trees reclaim their original low PIDs, so
/// the fresh child must start well above them.
const PID_FLOOR: &str = "9000";

/// What this invocation will do, decided once at startup.
#[derive(Debug, PartialEq, Eq)]
pub enum Mode {
    /// Re-materialize the tree checkpointed in the image directory.
    Restore { image_dir: PathBuf },
    /// Start the command fresh.
    Run,
}

/// Decide between restore and run mode.
///
/// Restore wins whenever the image directory holds a restorable image, even
/// if a command was also supplied. Run mode without a command is incoherent.
pub fn decide_mode(configuration: &Configuration, command: &[String]) -> Result<Mode, Error> {
    if let Some(image_dir) = configuration.image_dir() {
        if image::has_restorable_image(image_dir)? {
            return Ok(Mode::Restore {
                image_dir: image_dir.to_path_buf(),
            });
        }
    }
    if command.is_empty() {
        return Err(ConfigError::CommandRequired.into());
    }
    Ok(Mode::Run)
}

/// Run one supervisor invocation to completion and return the process exit
/// code.
pub async fn run(configuration: Configuration, command: Vec<String>) -> Result<i32, Error> {
    match decide_mode(&configuration, &command)? {
        Mode::Restore { image_dir } => {
            println!(
                "A checkpoint has been found in {}. Restoring.",
                image_dir.display()
            );
            let status = criu::restore_with_cmd(&image_dir)?;
            Ok(exit_code(status))
        }
        Mode::Run => run_command(configuration, command).await,
    }
}

async fn run_command(configuration: Configuration, command: Vec<String>) -> Result<i32, Error> {
    fs::write(NS_LAST_PID, PID_FLOOR).map_err(|source| NamespacePrepError::WriteNsLastPid {
        path: PathBuf::from(NS_LAST_PID),
        source,
    })?;

    let child = spawn_child(&command)?;
    let pid = match child.id() {
        Some(pid) => pid as i32,
        None => {
            return Err(NamespacePrepError::SpawnChild {
                source: std::io::Error::other("command exited before it was supervised"),
            }
            .into());
        }
    };
    println!("Command started with PID {pid}");

    let sigterm = signal(SignalKind::terminate())
        .map_err(|source| NamespacePrepError::InstallSignalHandler { source })?;

    match configuration.image_dir() {
        Some(image_dir) => {
            println!(
                "Setting up SIGTERM handler to take checkpoint in {}",
                image_dir.display()
            );
            let image_dir = image_dir.to_path_buf();
            supervise(configuration.clone(), image_dir, child, pid, sigterm).await
        }
        None => wait_forwarding(child, pid, sigterm).await,
    }
}

/// Spawn the child as the leader of a new session with an unshared IPC
/// namespace, stdin detached and stdio otherwise inherited.
fn spawn_child(command: &[String]) -> Result<Child, Error> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            unshare(CloneFlags::CLONE_NEWIPC)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            Ok(())
        });
    }
    cmd.spawn()
        .map_err(|source| NamespacePrepError::SpawnChild { source }.into())
}

/// No image directory: wait for the child, forwarding any SIGTERM so the
/// exit status mirrors the child in every case.
async fn wait_forwarding(
    mut child: Child,
    pid: i32,
    mut sigterm: SignalStream,
) -> Result<i32, Error> {
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|source| NamespacePrepError::WaitChild { source })?;
                return Ok(exit_code(status));
            }
            _ = sigterm.recv() => {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
    }
}

/// Image directory configured: the first SIGTERM decides between forwarding
/// and checkpointing. Later signals are dropped; the decision is made once.
async fn supervise(
    configuration: Configuration,
    image_dir: PathBuf,
    mut child: Child,
    pid: i32,
    mut sigterm: SignalStream,
) -> Result<i32, Error> {
    tokio::select! {
        status = child.wait() => {
            // The child finished on its own; nothing worth checkpointing.
            let status = status.map_err(|source| NamespacePrepError::WaitChild { source })?;
            Ok(exit_code(status))
        }
        _ = sigterm.recv() => {
            println!("Received SIGTERM.");
            checkpoint_or_forward(configuration, &image_dir, child, pid).await
        }
    }
}

async fn checkpoint_or_forward(
    configuration: Configuration,
    image_dir: &Path,
    mut child: Child,
    pid: i32,
) -> Result<i32, Error> {
    if let Some(url) = configuration.node_state_server_url() {
        let node = client::fetch_node_state(url).await?;
        tracing::debug!(name = %node.name, state = ?node.state, "node state");
        if node.state != NodeState::ShuttingDown {
            println!("Node is not in shutting down state. Not taking checkpoint.");
            kill(Pid::from_raw(pid), Signal::SIGTERM)
                .map_err(|source| NamespacePrepError::ForwardSignal { source })?;
            let status = child
                .wait()
                .await
                .map_err(|source| NamespacePrepError::WaitChild { source })?;
            return Ok(exit_code(status));
        }
    }

    let engine = criu::Criu::new();
    let duration = criu::take_checkpoint(&engine, pid, &configuration, image_dir)?;
    println!("Checkpoint taken in {duration:?}");
    // The engine terminated the child; reap it so nothing is left behind.
    let _ = child.wait().await;
    Ok(0)
}

/// Mirror a child exit status as a process exit code, using the shell
/// convention for signal deaths.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
