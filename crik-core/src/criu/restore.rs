//! Restore driver.
//!
//! Replays the on-disk side effects captured at checkpoint time, rebuilds
//! the inherited file descriptor table, and hands control to the engine's
//! restore CLI. The engine re-materializes the original process tree; no
//! child is spawned by the supervisor itself.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{close, dup2};

use crate::cgroup;
use crate::config::PersistedConfiguration;
use crate::error::RestoreError;
use crate::fsutil;
use crate::image::EXTRA_FILES_DIR;
use crate::mounts;

/// The engine expects this directory to exist before a restore.
const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Restore log file name, relative to the image directory.
const RESTORE_LOG_FILE: &str = "restore.log";

/// Index of the first inherited descriptor beyond stdin, stdout and stderr.
const FIRST_EXTRA_FD: i32 = 3;

/// Restore the process tree checkpointed in `image_dir` and return the
/// engine's exit status.
pub fn restore_with_cmd(image_dir: &Path) -> Result<ExitStatus, RestoreError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(X11_SOCKET_DIR)
        .map_err(|source| RestoreError::X11Dir {
            path: X11_SOCKET_DIR.into(),
            source,
        })?;

    fsutil::copy_tree(&image_dir.join(EXTRA_FILES_DIR), Path::new("/"))
        .map_err(|source| RestoreError::ExtraFilesCopy { source })?;

    let persisted = PersistedConfiguration::load(image_dir)?;
    let mut inherited: Vec<String> = persisted.unix_file_descriptor_trio.to_vec();

    let remap = cgroup::remap_for_restore(image_dir)?;
    inherited.extend(remap.inherit_paths);

    let args = restore_args(image_dir, &inherited);
    tracing::debug!(?args, "invoking restore engine");

    let mut cmd = Command::new("criu");
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // The remapped cgroup handles become the engine's fds 3, 4, ... so they
    // line up with the inherit-fd slots. Lift the sources above the target
    // range first; a dup2 must never clobber a source that is still pending.
    let lift_floor = FIRST_EXTRA_FD + remap.files.len() as i32;
    let mut lifted = Vec::with_capacity(remap.files.len());
    for file in &remap.files {
        let fd = fcntl(file.as_raw_fd(), FcntlArg::F_DUPFD(lift_floor)).map_err(|errno| {
            RestoreError::SpawnEngine {
                source: std::io::Error::from_raw_os_error(errno as i32),
            }
        })?;
        lifted.push(fd);
    }
    if !lifted.is_empty() {
        let child_fds = lifted.clone();
        unsafe {
            cmd.pre_exec(move || {
                for (i, &fd) in child_fds.iter().enumerate() {
                    if let Err(errno) = dup2(fd, FIRST_EXTRA_FD + i as i32) {
                        return Err(std::io::Error::from_raw_os_error(errno as i32));
                    }
                }
                for &fd in &child_fds {
                    let _ = close(fd);
                }
                Ok(())
            });
        }
    }

    let status = cmd
        .status()
        .map_err(|source| RestoreError::SpawnEngine { source });
    for fd in lifted {
        let _ = close(fd);
    }
    status
}

/// Build the restore CLI argument vector: the fixed flag set, one
/// `--external` per mount-table entry, then one `--inherit-fd fd[i]:target`
/// per inherited descriptor, in slot order.
fn restore_args(image_dir: &Path, inherited: &[String]) -> Vec<String> {
    let mut args = vec![
        "restore".to_string(),
        "--images-dir".to_string(),
        image_dir.display().to_string(),
        "--tcp-established".to_string(),
        "--file-locks".to_string(),
        "--evasive-devices".to_string(),
        "--tcp-close".to_string(),
        "--manage-cgroups=ignore".to_string(),
        "-v4".to_string(),
        "--log-file".to_string(),
        RESTORE_LOG_FILE.to_string(),
    ];
    for mount in mounts::external_for_restore() {
        args.push("--external".to_string());
        args.push(mount);
    }
    for (i, target) in inherited.iter().enumerate() {
        args.push("--inherit-fd".to_string());
        args.push(format!("fd[{i}]:{target}"));
    }
    args
}
